//! §4.J step 6 — final report assembly. Plain serializable data; rendering
//! to Markdown/JSON/terminal output is an external collaborator (§1 "Out of
//! scope").

use serde::Serialize;

use crate::platform::TimeRange;
use crate::summarizer::GroupSummary;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub channel_kind: String,
    pub groups: Vec<GroupSummary>,
    pub total_messages: usize,
    pub total_user_messages: usize,
    /// Sort key for the report's `channels[]` (§4.J step 6: "sorted by total
    /// interactions descending"). Defined as the channel's total user
    /// (non-context) message count across its groups.
    pub total_interactions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub schema_version: u32,
    pub generated_at: f64,
    pub user_id: String,
    pub range_start: f64,
    pub range_end: f64,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DigestReport {
    pub metadata: ReportMetadata,
    pub channels: Vec<ChannelReport>,
    pub total_messages_sent: usize,
    pub total_mentions: usize,
    pub total_reactions: usize,
    pub total_groups: usize,
}

impl DigestReport {
    pub fn range(&self) -> TimeRange {
        TimeRange { start: self.metadata.range_start, end: self.metadata.range_end }
    }
}
