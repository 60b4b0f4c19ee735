//! In-memory [`ChatPlatformClient`] test double. Exists so unit/integration
//! tests in this crate are runnable without a live workspace (SPEC_FULL.md §E).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatPlatformClient, Channel, Message, Reaction, SearchHit, TimeRange};

#[derive(Default)]
pub struct FakeChatPlatformClient {
    pub current_user: String,
    pub channels: Vec<Channel>,
    pub history: HashMap<String, Vec<Message>>,
    pub threads: HashMap<(String, String), Vec<Message>>,
    pub search_hits: Vec<SearchHit>,
    pub reactions: Vec<Reaction>,
    pub display_names: HashMap<String, String>,
    pub permalinks: Mutex<HashMap<(String, String), String>>,
    pub search_should_fail: bool,
    pub permalink_should_fail: bool,
}

impl FakeChatPlatformClient {
    pub fn new(current_user: impl Into<String>) -> Self {
        Self {
            current_user: current_user.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChatPlatformClient for FakeChatPlatformClient {
    async fn current_user(&self) -> anyhow::Result<String> {
        Ok(self.current_user.clone())
    }

    async fn search_messages(&self, _query: &str, range: TimeRange) -> anyhow::Result<Vec<SearchHit>> {
        if self.search_should_fail {
            anyhow::bail!("search unavailable");
        }
        Ok(self
            .search_hits
            .iter()
            .filter(|h| range.contains(h.message.ts_seconds()))
            .cloned()
            .collect())
    }

    async fn member_channels(&self, _user_id: &str) -> anyhow::Result<Vec<Channel>> {
        Ok(self.channels.clone())
    }

    async fn channel_info(&self, channel_id: &str) -> anyhow::Result<Channel> {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("channel not found: {channel_id}"))
    }

    async fn channel_history(&self, channel_id: &str, range: TimeRange) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .history
            .get(channel_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| range.contains(m.ts_seconds()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn thread_replies(&self, channel_id: &str, parent_ts: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .threads
            .get(&(channel_id.to_string(), parent_ts.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn reactions_list(&self, user_id: &str, range: TimeRange) -> anyhow::Result<Vec<Reaction>> {
        Ok(self
            .reactions
            .iter()
            .filter(|r| r.user == user_id && range.contains(r.ts.parse().unwrap_or(0.0)))
            .cloned()
            .collect())
    }

    async fn user_display_name(&self, user_id: &str) -> anyhow::Result<String> {
        self.display_names
            .get(user_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("user not found: {user_id}"))
    }

    async fn users_list(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self
            .display_names
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn permalink(&self, channel_id: &str, ts: &str) -> anyhow::Result<String> {
        let key = (channel_id.to_string(), ts.to_string());
        if let Some(link) = self.permalinks.lock().unwrap().get(&key) {
            return Ok(link.clone());
        }
        if self.permalink_should_fail {
            anyhow::bail!("permalink unavailable");
        }
        let split = super::super::references::normalize::split_ts_to_url_form(ts);
        Ok(format!("https://workspace.slack.com/archives/{channel_id}/p{split}"))
    }

    async fn get_message(&self, channel_id: &str, ts: &str) -> anyhow::Result<Option<Message>> {
        Ok(self
            .history
            .get(channel_id)
            .and_then(|msgs| msgs.iter().find(|m| m.ts == ts).cloned()))
    }
}
