//! §3 — Conversation and ConversationGroup, the two value types that flow
//! from the segmenter through the consolidator to the summarizer. Neither is
//! persisted (§3 "Ownership"): the cache store owns raw rows, these are
//! transient per-run values.

use crate::platform::Message;

/// A contiguous subsequence of a channel's messages (or a thread's replies)
/// produced by the segmenter (§4.E). Invariants (§8): `messages` sorted by
/// ts ascending; `start_time == messages[0].ts`; `end_time == messages.last().ts`.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub is_thread: bool,
    pub thread_parent_ts: Option<String>,
    pub messages: Vec<Message>,
    pub start_time: f64,
    pub end_time: f64,
    pub participants: Vec<String>,
    pub message_count: usize,
    pub user_message_count: usize,
    /// Set by the summarizer's permalink enrichment pass (§4.H step 5) after
    /// construction; absent until then.
    pub permalink: Option<String>,
}

impl Conversation {
    /// Build a conversation from an already-time-ordered message slice,
    /// deriving every invariant-bound field instead of taking them as
    /// parameters — this is the only constructor so the invariants in §8
    /// can't be violated by a caller passing inconsistent values.
    pub fn from_messages(
        id: impl Into<String>,
        channel_id: impl Into<String>,
        channel_name: Option<String>,
        is_thread: bool,
        thread_parent_ts: Option<String>,
        mut messages: Vec<Message>,
    ) -> Self {
        messages.sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());
        let start_time = messages.first().map(|m| m.ts_seconds()).unwrap_or(0.0);
        let end_time = messages.last().map(|m| m.ts_seconds()).unwrap_or(0.0);
        let participants = unique_participants(&messages);
        let message_count = messages.len();
        let user_message_count = messages.iter().filter(|m| !m.is_context()).count();

        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            channel_name,
            is_thread,
            thread_parent_ts,
            messages,
            start_time,
            end_time,
            participants,
            message_count,
            user_message_count,
            permalink: None,
        }
    }

    /// Recompute the derived fields after messages were merged in place
    /// (context enrichment, bot/trivial merges). `user_message_count` is
    /// deliberately NOT touched here — callers that add context messages
    /// must not let this bump it (§4.E: "context messages do not count
    /// toward user activity").
    pub fn resort_and_recompute(&mut self) {
        self.messages
            .sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());
        self.start_time = self.messages.first().map(|m| m.ts_seconds()).unwrap_or(0.0);
        self.end_time = self.messages.last().map(|m| m.ts_seconds()).unwrap_or(0.0);
        self.participants = unique_participants(&self.messages);
        self.message_count = self.messages.len();
    }

    pub fn joined_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.text.as_deref())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_bot_conversation(&self) -> bool {
        !self.messages.is_empty() && self.messages.iter().all(|m| m.is_bot_message())
    }
}

fn unique_participants(messages: &[Message]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for m in messages {
        if let Some(u) = &m.user {
            if seen.insert(u.clone()) {
                out.push(u.clone());
            }
        }
    }
    out
}

/// A topic: the consolidator's judgement that several conversations cover
/// the same subject (§3). `all_messages` is the ordered union of its
/// conversations' messages.
#[derive(Debug, Clone)]
pub struct ConversationGroup {
    pub id: String,
    pub conversations: Vec<Conversation>,
    pub shared_references: Vec<String>,
    pub all_messages: Vec<Message>,
    pub start_time: f64,
    pub end_time: f64,
    pub participants: Vec<String>,
    pub total_message_count: usize,
    pub total_user_message_count: usize,
    pub has_threads: bool,
    pub original_conversation_ids: Vec<String>,
}

impl ConversationGroup {
    pub fn from_conversations(
        id: impl Into<String>,
        conversations: Vec<Conversation>,
        shared_references: Vec<String>,
    ) -> Self {
        let original_conversation_ids = conversations.iter().map(|c| c.id.clone()).collect();
        let has_threads = conversations.iter().any(|c| c.is_thread);

        let mut all_messages: Vec<Message> =
            conversations.iter().flat_map(|c| c.messages.clone()).collect();
        all_messages.sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());

        let start_time = all_messages.first().map(|m| m.ts_seconds()).unwrap_or(0.0);
        let end_time = all_messages.last().map(|m| m.ts_seconds()).unwrap_or(0.0);
        let participants = unique_participants(&all_messages);
        let total_message_count = all_messages.len();
        let total_user_message_count = conversations.iter().map(|c| c.user_message_count).sum();

        Self {
            id: id.into(),
            conversations,
            shared_references,
            all_messages,
            start_time,
            end_time,
            participants,
            total_message_count,
            total_user_message_count,
            has_threads,
            original_conversation_ids,
        }
    }

    pub fn segments_merged(&self) -> bool {
        self.conversations.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Message;

    fn msg(ts: &str, user: Option<&str>, text: &str) -> Message {
        Message {
            ts: ts.to_string(),
            channel_id: "C1".to_string(),
            user: user.map(str::to_string),
            text: Some(text.to_string()),
            msg_type: "message".to_string(),
            subtype: None,
            thread_parent_ts: None,
            attachments: vec![],
        }
    }

    #[test]
    fn conversation_invariants_hold() {
        let c = Conversation::from_messages(
            "conv1",
            "C1",
            None,
            false,
            None,
            vec![msg("3.0", Some("U2"), "b"), msg("1.0", Some("U1"), "a")],
        );
        assert_eq!(c.start_time, 1.0);
        assert_eq!(c.end_time, 3.0);
        assert_eq!(c.messages[0].ts, "1.0");
        assert_eq!(c.participants, vec!["U1".to_string(), "U2".to_string()]);
    }

    #[test]
    fn group_all_messages_is_sorted_union() {
        let a = Conversation::from_messages("a", "C1", None, false, None, vec![msg("1.0", Some("U1"), "x")]);
        let b = Conversation::from_messages("b", "C1", None, false, None, vec![msg("2.0", Some("U2"), "y")]);
        let g = ConversationGroup::from_conversations("g1", vec![b, a], vec![]);
        assert_eq!(g.all_messages.len(), 2);
        assert_eq!(g.all_messages[0].ts, "1.0");
        assert_eq!(g.all_messages[1].ts, "2.0");
        assert!(g.segments_merged());
    }

    #[test]
    fn context_messages_excluded_from_user_message_count() {
        let mut extra = msg("0.5", Some("U1"), "earlier");
        extra.subtype = Some(crate::platform::SUBTYPE_CONTEXT.to_string());
        let mut c = Conversation::from_messages(
            "conv1",
            "C1",
            None,
            false,
            None,
            vec![msg("1.0", Some("U1"), "a")],
        );
        assert_eq!(c.user_message_count, 1);
        c.messages.push(extra);
        c.resort_and_recompute();
        assert_eq!(c.message_count, 2);
        assert_eq!(c.user_message_count, 1, "context messages must not count as user activity");
    }
}
