//! Chat-platform wire types and the client trait the rest of the pipeline
//! consumes (§1: "external client providing typed methods" — assumed given,
//! specified here only to the extent the core calls through it).

pub mod fake;
pub mod slack_http;

pub use slack_http::SlackHttpClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single chat message. `ts` is kept as a string (the platform's stable
/// identity/ordering key) and parsed to `f64` only for comparison — see
/// [`Message::ts_seconds`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub ts: String,
    pub channel_id: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "type", default = "default_message_type")]
    pub msg_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub thread_parent_ts: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

fn default_message_type() -> String {
    "message".to_string()
}

pub const SUBTYPE_BOT_MESSAGE: &str = "bot_message";
pub const SUBTYPE_CONTEXT: &str = "CONTEXT";
pub const SUBTYPE_MENTION_CONTEXT: &str = "MENTION_CONTEXT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_unfurl: bool,
}

impl Message {
    /// Parse `ts` as a decimal `seconds.microseconds` value for ordering.
    /// Returns `0.0` for malformed timestamps rather than panicking — a
    /// defensive fallback for cache rows written by a future schema version.
    pub fn ts_seconds(&self) -> f64 {
        self.ts.parse().unwrap_or(0.0)
    }

    pub fn is_thread_reply(&self) -> bool {
        matches!(&self.thread_parent_ts, Some(parent) if parent != &self.ts)
    }

    pub fn is_bot_message(&self) -> bool {
        self.subtype.as_deref() == Some(SUBTYPE_BOT_MESSAGE)
            || (self.user.is_none() && self.text.is_some())
    }

    pub fn is_context(&self) -> bool {
        matches!(
            self.subtype.as_deref(),
            Some(SUBTYPE_CONTEXT) | Some(SUBTYPE_MENTION_CONTEXT)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Public,
    Private,
    Dm,
    GroupDm,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Dm => "dm",
            Self::GroupDm => "group_dm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ChannelKind,
    #[serde(default)]
    pub members: Option<Vec<String>>,
    #[serde(default)]
    pub peer_user: Option<String>,
}

impl Channel {
    /// DM channels are identified by id prefix `D` (§3).
    pub fn is_dm_id(channel_id: &str) -> bool {
        channel_id.starts_with('D')
    }

    /// Group-DM display name, derived from membership first and falling
    /// back to parsing `mpdm-<name1>--<name2>-<N>` with the requester
    /// filtered out (§3).
    pub fn group_dm_display_name(&self, requester_id: &str, member_names: &[(String, String)]) -> String {
        if let Some(members) = &self.members {
            let names: Vec<&str> = members
                .iter()
                .filter(|id| *id != requester_id)
                .filter_map(|id| {
                    member_names
                        .iter()
                        .find(|(mid, _)| mid == id)
                        .map(|(_, name)| name.as_str())
                })
                .collect();
            if !names.is_empty() {
                return names.join(", ");
            }
        }
        if let Some(name) = &self.name {
            return parse_mpdm_name(name, requester_id);
        }
        self.id.clone()
    }
}

/// Parse the canonical `mpdm-<name1>--<name2>-<N>` group-DM name format,
/// filtering out the requester's own display name if present among the
/// parsed members.
fn parse_mpdm_name(raw: &str, requester_display_name: &str) -> String {
    let Some(body) = raw.strip_prefix("mpdm-") else {
        return raw.to_string();
    };
    // Trailing "-N" count suffix.
    let body = match body.rfind('-') {
        Some(idx) if body[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &body[..idx],
        _ => body,
    };
    let names: Vec<&str> = body
        .split("--")
        .filter(|n| !n.is_empty() && *n != requester_display_name)
        .collect();
    if names.is_empty() {
        raw.to_string()
    } else {
        names.join(", ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub channel_id: String,
    pub ts: String,
    pub name: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn contains(&self, ts: f64) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// The fetcher's 24h lookback extension (§4.C phase 2), distinguished
    /// from the original range used for "sent by user" counting.
    pub fn extended_lookback(&self, hours: f64) -> TimeRange {
        TimeRange {
            start: self.start - hours * 3600.0,
            end: self.end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message: Message,
    pub thread_parent_ts: Option<String>,
}

/// The typed chat-platform RPC surface the rest of the crate depends on.
/// A real implementation wraps the platform's REST API (out of core scope
/// per §1); [`fake::FakeChatPlatformClient`] is the in-memory test double.
#[async_trait]
pub trait ChatPlatformClient: Send + Sync {
    async fn current_user(&self) -> anyhow::Result<String>;

    /// Full-text search `query` within `range`, returning hits (with thread
    /// parent info when a hit is itself a thread reply).
    async fn search_messages(&self, query: &str, range: TimeRange) -> anyhow::Result<Vec<SearchHit>>;

    async fn member_channels(&self, user_id: &str) -> anyhow::Result<Vec<Channel>>;

    async fn channel_info(&self, channel_id: &str) -> anyhow::Result<Channel>;

    /// Page through a channel's history intersecting `range`.
    async fn channel_history(&self, channel_id: &str, range: TimeRange) -> anyhow::Result<Vec<Message>>;

    async fn thread_replies(&self, channel_id: &str, parent_ts: &str) -> anyhow::Result<Vec<Message>>;

    async fn reactions_list(&self, user_id: &str, range: TimeRange) -> anyhow::Result<Vec<Reaction>>;

    async fn user_display_name(&self, user_id: &str) -> anyhow::Result<String>;

    async fn users_list(&self) -> anyhow::Result<Vec<(String, String)>>;

    async fn permalink(&self, channel_id: &str, ts: &str) -> anyhow::Result<String>;

    async fn get_message(&self, channel_id: &str, ts: &str) -> anyhow::Result<Option<Message>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_seconds_parses_decimal() {
        let m = Message {
            ts: "1700000000.000100".into(),
            channel_id: "C1".into(),
            user: Some("U1".into()),
            text: Some("hi".into()),
            msg_type: "message".into(),
            subtype: None,
            thread_parent_ts: None,
            attachments: vec![],
        };
        assert!((m.ts_seconds() - 1700000000.0001).abs() < 1e-6);
    }

    #[test]
    fn bot_message_detection() {
        let bot_by_subtype = Message {
            ts: "1.0".into(),
            channel_id: "C1".into(),
            user: Some("U1".into()),
            text: Some("deployed".into()),
            msg_type: "message".into(),
            subtype: Some(SUBTYPE_BOT_MESSAGE.into()),
            thread_parent_ts: None,
            attachments: vec![],
        };
        assert!(bot_by_subtype.is_bot_message());

        let bot_by_missing_user = Message {
            ts: "1.0".into(),
            channel_id: "C1".into(),
            user: None,
            text: Some("deployed".into()),
            msg_type: "message".into(),
            subtype: None,
            thread_parent_ts: None,
            attachments: vec![],
        };
        assert!(bot_by_missing_user.is_bot_message());

        let human = Message {
            ts: "1.0".into(),
            channel_id: "C1".into(),
            user: Some("U1".into()),
            text: Some("hi".into()),
            msg_type: "message".into(),
            subtype: None,
            thread_parent_ts: None,
            attachments: vec![],
        };
        assert!(!human.is_bot_message());
    }

    #[test]
    fn mpdm_name_parsing_filters_requester() {
        let parsed = parse_mpdm_name("mpdm-alice--bob--carol-3", "bob");
        assert_eq!(parsed, "alice, carol");
    }

    #[test]
    fn dm_id_prefix() {
        assert!(Channel::is_dm_id("D12345"));
        assert!(!Channel::is_dm_id("C12345"));
    }
}
