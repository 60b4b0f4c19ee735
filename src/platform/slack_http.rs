//! A concrete `ChatPlatformClient` over the Slack Web API. The wire format
//! of the platform's REST API is out of core scope (§1), but the binary
//! needs a real implementation to talk to, so this exists as the default
//! one — same plain "build request, parse response" idiom as
//! [`crate::embedding::http_provider::HttpEmbeddingProvider`] and
//! `llm::sdk_backend::SdkBackend`, generalized to Slack's handful of
//! `conversations.*`/`search.*`/`users.*` endpoints.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{Channel, ChannelKind, Message, Reaction, SearchHit, TimeRange};

const BASE_URL: &str = "https://slack.com/api";
const MAX_PAGES: usize = 25;

pub struct SlackHttpClient {
    token: String,
    client: reqwest::Client,
    base_url: String,
}

impl SlackHttpClient {
    pub fn new(token: String) -> Self {
        Self {
            token,
            client: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(token: String, base_url: String) -> Self {
        Self { token, client: reqwest::Client::new(), base_url }
    }

    async fn get(&self, method: &str, params: &[(&str, String)]) -> anyhow::Result<Value> {
        let url = format!("{}/{}", self.base_url, method);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        if !status.is_success() {
            anyhow::bail!("slack {method} returned HTTP {status}");
        }
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = body.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
            anyhow::bail!("slack {method} error: {err}");
        }
        Ok(body)
    }
}

fn raw_message_to_message(channel_id: &str, raw: &Value) -> Message {
    Message {
        ts: raw.get("ts").and_then(Value::as_str).unwrap_or_default().to_string(),
        channel_id: channel_id.to_string(),
        user: raw.get("user").and_then(Value::as_str).map(str::to_string),
        text: raw.get("text").and_then(Value::as_str).map(str::to_string),
        msg_type: raw.get("type").and_then(Value::as_str).unwrap_or("message").to_string(),
        subtype: raw.get("subtype").and_then(Value::as_str).map(str::to_string),
        thread_parent_ts: raw.get("thread_ts").and_then(Value::as_str).map(str::to_string),
        attachments: Vec::new(),
    }
}

fn channel_kind_of(raw: &Value) -> ChannelKind {
    if raw.get("is_im").and_then(Value::as_bool) == Some(true) {
        ChannelKind::Dm
    } else if raw.get("is_mpim").and_then(Value::as_bool) == Some(true) {
        ChannelKind::GroupDm
    } else if raw.get("is_private").and_then(Value::as_bool) == Some(true) {
        ChannelKind::Private
    } else {
        ChannelKind::Public
    }
}

fn raw_to_channel(raw: &Value) -> Channel {
    Channel {
        id: raw.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        name: raw.get("name").and_then(Value::as_str).map(str::to_string),
        kind: channel_kind_of(raw),
        members: raw
            .get("members")
            .and_then(Value::as_array)
            .map(|m| m.iter().filter_map(Value::as_str).map(str::to_string).collect()),
        peer_user: raw.get("user").and_then(Value::as_str).map(str::to_string),
    }
}

#[async_trait]
impl super::ChatPlatformClient for SlackHttpClient {
    async fn current_user(&self) -> anyhow::Result<String> {
        let body = self.get("auth.test", &[]).await?;
        body.get("user_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("auth.test response missing user_id"))
    }

    async fn search_messages(&self, query: &str, range: TimeRange) -> anyhow::Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        let mut page = 1u32;
        loop {
            let body = self
                .get(
                    "search.messages",
                    &[("query", query.to_string()), ("count", "100".to_string()), ("page", page.to_string())],
                )
                .await?;
            let matches = body
                .get("messages")
                .and_then(|m| m.get("matches"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if matches.is_empty() {
                break;
            }
            for raw in &matches {
                let channel_id = raw.get("channel").and_then(|c| c.get("id")).and_then(Value::as_str).unwrap_or_default();
                let message = raw_message_to_message(channel_id, raw);
                if range.contains(message.ts_seconds()) {
                    hits.push(SearchHit { thread_parent_ts: message.thread_parent_ts.clone(), message });
                }
            }
            let pagination_pages = body
                .get("messages")
                .and_then(|m| m.get("pagination"))
                .and_then(|p| p.get("page_count"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            page += 1;
            if u64::from(page) > pagination_pages || page as usize > MAX_PAGES {
                break;
            }
        }
        Ok(hits)
    }

    async fn member_channels(&self, _user_id: &str) -> anyhow::Result<Vec<Channel>> {
        let mut channels = Vec::new();
        let mut cursor = String::new();
        for _ in 0..MAX_PAGES {
            let mut params = vec![
                ("types", "public_channel,private_channel,mpim,im".to_string()),
                ("limit", "200".to_string()),
                ("exclude_archived", "true".to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.clone()));
            }
            let body = self.get("users.conversations", &params).await?;
            let raw_channels = body.get("channels").and_then(Value::as_array).cloned().unwrap_or_default();
            channels.extend(raw_channels.iter().map(raw_to_channel));
            cursor = body
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                break;
            }
        }
        Ok(channels)
    }

    async fn channel_info(&self, channel_id: &str) -> anyhow::Result<Channel> {
        let body = self.get("conversations.info", &[("channel", channel_id.to_string())]).await?;
        let raw = body
            .get("channel")
            .ok_or_else(|| anyhow::anyhow!("conversations.info response missing channel"))?;
        Ok(raw_to_channel(raw))
    }

    async fn channel_history(&self, channel_id: &str, range: TimeRange) -> anyhow::Result<Vec<Message>> {
        let mut messages = Vec::new();
        let mut cursor = String::new();
        for _ in 0..MAX_PAGES {
            let mut params = vec![
                ("channel", channel_id.to_string()),
                ("oldest", format!("{:.6}", range.start)),
                ("latest", format!("{:.6}", range.end)),
                ("inclusive", "true".to_string()),
                ("limit", "200".to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.clone()));
            }
            let body = self.get("conversations.history", &params).await?;
            let raw_messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
            messages.extend(raw_messages.iter().map(|raw| raw_message_to_message(channel_id, raw)));
            cursor = body
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                break;
            }
        }
        Ok(messages)
    }

    async fn thread_replies(&self, channel_id: &str, parent_ts: &str) -> anyhow::Result<Vec<Message>> {
        let mut replies = Vec::new();
        let mut cursor = String::new();
        for _ in 0..MAX_PAGES {
            let mut params = vec![
                ("channel", channel_id.to_string()),
                ("ts", parent_ts.to_string()),
                ("limit", "200".to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.clone()));
            }
            let body = self.get("conversations.replies", &params).await?;
            let raw_messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
            replies.extend(raw_messages.iter().map(|raw| raw_message_to_message(channel_id, raw)));
            cursor = body
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                break;
            }
        }
        Ok(replies)
    }

    async fn reactions_list(&self, user_id: &str, range: TimeRange) -> anyhow::Result<Vec<Reaction>> {
        let mut reactions = Vec::new();
        let mut cursor = String::new();
        for _ in 0..MAX_PAGES {
            let mut params = vec![("user", user_id.to_string()), ("limit", "200".to_string()), ("full", "true".to_string())];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.clone()));
            }
            let body = self.get("reactions.list", &params).await?;
            let items = body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
            for item in &items {
                let Some(message) = item.get("message") else { continue };
                let channel_id = item.get("channel").and_then(Value::as_str).unwrap_or_default();
                let ts = message.get("ts").and_then(Value::as_str).unwrap_or_default();
                let t: f64 = ts.parse().unwrap_or(0.0);
                if !range.contains(t) {
                    continue;
                }
                let names = message.get("reactions").and_then(Value::as_array).cloned().unwrap_or_default();
                for r in &names {
                    let users = r.get("users").and_then(Value::as_array).cloned().unwrap_or_default();
                    if users.iter().any(|u| u.as_str() == Some(user_id)) {
                        reactions.push(Reaction {
                            channel_id: channel_id.to_string(),
                            ts: ts.to_string(),
                            name: r.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                            user: user_id.to_string(),
                        });
                    }
                }
            }
            cursor = body
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                break;
            }
        }
        Ok(reactions)
    }

    async fn user_display_name(&self, user_id: &str) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct UserInfoProfile {
            display_name: Option<String>,
            real_name: Option<String>,
        }
        #[derive(Deserialize)]
        struct UserInfoUser {
            profile: Option<UserInfoProfile>,
            real_name: Option<String>,
            name: Option<String>,
        }
        let body = self.get("users.info", &[("user", user_id.to_string())]).await?;
        let user: UserInfoUser = serde_json::from_value(
            body.get("user").cloned().ok_or_else(|| anyhow::anyhow!("users.info missing user"))?,
        )?;
        let name = user
            .profile
            .and_then(|p| p.display_name.filter(|n| !n.is_empty()).or(p.real_name))
            .or(user.real_name)
            .or(user.name)
            .unwrap_or_else(|| user_id.to_string());
        Ok(name)
    }

    async fn users_list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let mut cursor = String::new();
        for _ in 0..MAX_PAGES {
            let mut params = vec![("limit", "200".to_string())];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.clone()));
            }
            let body = self.get("users.list", &params).await?;
            let members = body.get("members").and_then(Value::as_array).cloned().unwrap_or_default();
            for member in &members {
                let id = member.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let profile = member.get("profile");
                let display = profile
                    .and_then(|p| p.get("display_name"))
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                    .or_else(|| member.get("real_name").and_then(Value::as_str))
                    .unwrap_or(&id)
                    .to_string();
                out.push((id, display));
            }
            cursor = body
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                break;
            }
        }
        Ok(out)
    }

    async fn permalink(&self, channel_id: &str, ts: &str) -> anyhow::Result<String> {
        let body = self
            .get("chat.getPermalink", &[("channel", channel_id.to_string()), ("message_ts", ts.to_string())])
            .await?;
        body.get("permalink")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("chat.getPermalink response missing permalink"))
    }

    async fn get_message(&self, channel_id: &str, ts: &str) -> anyhow::Result<Option<Message>> {
        let body = self
            .get(
                "conversations.history",
                &[
                    ("channel", channel_id.to_string()),
                    ("latest", ts.to_string()),
                    ("oldest", ts.to_string()),
                    ("inclusive", "true".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .map(|raw| raw_message_to_message(channel_id, raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_message_extracts_core_fields() {
        let raw = serde_json::json!({
            "ts": "1700000000.000100",
            "user": "U1",
            "text": "hello",
            "type": "message",
            "thread_ts": "1699999999.000000",
        });
        let msg = raw_message_to_message("C1", &raw);
        assert_eq!(msg.ts, "1700000000.000100");
        assert_eq!(msg.user.as_deref(), Some("U1"));
        assert_eq!(msg.thread_parent_ts.as_deref(), Some("1699999999.000000"));
    }

    #[test]
    fn channel_kind_prefers_im_over_private() {
        let raw = serde_json::json!({"id": "D1", "is_im": true, "is_private": true});
        assert_eq!(channel_kind_of(&raw), ChannelKind::Dm);
    }

    #[test]
    fn channel_kind_defaults_to_public() {
        let raw = serde_json::json!({"id": "C1"});
        assert_eq!(channel_kind_of(&raw), ChannelKind::Public);
    }
}
