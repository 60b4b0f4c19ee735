//! §4.H — Summarizer driver. For each [`ConversationGroup`]: resolve
//! display names, enrich with permalinks/linked-message attachments, build
//! a prompt, call the LLM (single or batched), and fall back to a
//! word-stem summary on any parse/RPC failure (grounded on
//! `backend/src/memory/features/message_pipeline/analyzers/chat_analyzer.rs`'s
//! prompt-construction + batch-JSON-parse + fallback shape).

mod names;
mod permalink;
mod prompt;

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::http_client::HttpClient;
use crate::llm::{LlmBackend, LlmMessage};
use crate::model::ConversationGroup;
use crate::platform::ChatPlatformClient;

pub use names::DisplayNameResolver;

#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    pub single_max_tokens: u32,
    pub batch_max_tokens: u32,
    pub batch_threshold: usize,
    pub single_message_max_chars: usize,
    pub batch_message_max_chars: usize,
    pub attachment_max_chars: usize,
    pub permalink_concurrency: usize,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            single_max_tokens: 2048,
            batch_max_tokens: 4096,
            batch_threshold: 2,
            single_message_max_chars: 5000,
            batch_message_max_chars: 200,
            attachment_max_chars: 300,
            permalink_concurrency: 10,
        }
    }
}

/// §4.H step 4: the per-group digest entry.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub narrative_summary: String,
    pub start_time: f64,
    pub end_time: f64,
    pub message_count: usize,
    pub user_messages: usize,
    pub participants: Vec<String>,
    pub key_events: Vec<String>,
    pub references: Vec<String>,
    pub outcome: Option<String>,
    pub next_actions: Vec<String>,
    pub timesheet_entry: String,
    pub slack_link: String,
    pub slack_links: Vec<String>,
    pub segments_merged: bool,
}

#[derive(Deserialize)]
struct LlmGroupResult {
    narrative_summary: String,
    #[serde(default)]
    key_events: Vec<String>,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    next_actions: Vec<String>,
}

pub struct Summarizer {
    platform: Arc<dyn ChatPlatformClient>,
    http: Arc<HttpClient>,
    llm: Arc<dyn LlmBackend>,
    names: Arc<DisplayNameResolver>,
    model: String,
    settings: SummarizerSettings,
    /// §5: the process-global Claude-concurrency limiter, shared across
    /// every channel's summarizer instance so total in-flight LLM calls stay
    /// bounded regardless of channel parallelism. Callers construct one
    /// [`tokio::sync::Semaphore`] at the aggregator boundary and pass it in.
    claude_concurrency: Arc<Semaphore>,
}

impl Summarizer {
    pub fn new(
        platform: Arc<dyn ChatPlatformClient>,
        http: Arc<HttpClient>,
        llm: Arc<dyn LlmBackend>,
        model: String,
        settings: SummarizerSettings,
        claude_concurrency: Arc<Semaphore>,
    ) -> Self {
        let names = DisplayNameResolver::new(platform.clone(), http.clone());
        Self { platform, http, llm, names, model, settings, claude_concurrency }
    }

    pub fn name_resolver(&self) -> &Arc<DisplayNameResolver> {
        &self.names
    }

    /// Summarize all of one channel's groups (§4.H). Groups are expected to
    /// already be in `start_time` order (the consolidator guarantees this).
    pub async fn summarize_groups(
        &self,
        mut groups: Vec<ConversationGroup>,
        requesting_user: &str,
    ) -> Vec<GroupSummary> {
        permalink::enrich_groups(&self.platform, &self.http, &mut groups, self.settings.permalink_concurrency).await;

        let names = self.collect_display_names(&groups, requesting_user).await;

        if groups.len() <= self.settings.batch_threshold {
            return self.summarize_each(&groups, requesting_user, &names).await;
        }

        match self.summarize_batch(&groups, requesting_user, &names).await {
            Some(results) if results.len() == groups.len() => results,
            _ => {
                warn!(count = groups.len(), "batch summarization size mismatch or failure, falling back to individual calls");
                self.summarize_each(&groups, requesting_user, &names).await
            }
        }
    }

    async fn summarize_each(
        &self,
        groups: &[ConversationGroup],
        requesting_user: &str,
        names: &HashMap<String, String>,
    ) -> Vec<GroupSummary> {
        let mut results: Vec<(usize, GroupSummary)> = stream::iter(groups.iter().enumerate())
            .map(|(idx, group)| async move { (idx, self.summarize_single(group, requesting_user, names).await) })
            .buffer_unordered(groups.len().max(1))
            .collect::<Vec<_>>()
            .await;
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, s)| s).collect()
    }

    async fn collect_display_names(&self, groups: &[ConversationGroup], requesting_user: &str) -> HashMap<String, String> {
        let mut ids: std::collections::HashSet<String> = std::collections::HashSet::new();
        for group in groups {
            for message in &group.all_messages {
                if let Some(u) = &message.user {
                    ids.insert(u.clone());
                }
                for attachment in &message.attachments {
                    if let Some(u) = &attachment.author_id {
                        ids.insert(u.clone());
                    }
                }
            }
        }
        ids.remove(requesting_user);

        let resolved = stream::iter(ids.into_iter())
            .map(|id| {
                let names = self.names.clone();
                async move {
                    let name = names.resolve(&id).await;
                    (id, name)
                }
            })
            .buffer_unordered(8)
            .collect::<Vec<_>>()
            .await;
        resolved.into_iter().collect()
    }

    async fn summarize_single(&self, group: &ConversationGroup, requesting_user: &str, names: &HashMap<String, String>) -> GroupSummary {
        let text = prompt::build_single_prompt(
            group,
            requesting_user,
            names,
            self.settings.single_message_max_chars,
            self.settings.attachment_max_chars,
        );

        let parsed = self.call_llm(&text, self.settings.single_max_tokens).await.and_then(|raw| parse_single(&raw));

        match parsed {
            Some(result) => self.assemble(group, requesting_user, names, result),
            None => self.assemble_fallback(group, requesting_user, names),
        }
    }

    async fn summarize_batch(
        &self,
        groups: &[ConversationGroup],
        requesting_user: &str,
        names: &HashMap<String, String>,
    ) -> Option<Vec<GroupSummary>> {
        let refs: Vec<&ConversationGroup> = groups.iter().collect();
        let text = prompt::build_batch_prompt(
            &refs,
            requesting_user,
            names,
            self.settings.batch_message_max_chars,
            self.settings.attachment_max_chars,
        );

        let raw = self.call_llm(&text, self.settings.batch_max_tokens).await?;
        let results: Vec<LlmGroupResult> = serde_json::from_str(extract_json_array(&raw)).ok()?;
        if results.len() != groups.len() {
            return None;
        }

        Some(
            groups
                .iter()
                .zip(results)
                .map(|(group, result)| self.assemble(group, requesting_user, names, result))
                .collect(),
        )
    }

    async fn call_llm(&self, prompt_text: &str, max_tokens: u32) -> Option<String> {
        let _permit = self.claude_concurrency.acquire().await.ok()?;
        let messages = [LlmMessage::user(prompt_text)];
        match self.http.execute(|| async { self.llm.create_message(&self.model, max_tokens, &messages).await }).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(error = %err, "LLM call failed, falling back to word-stem summary");
                None
            }
        }
    }

    fn assemble(
        &self,
        group: &ConversationGroup,
        requesting_user: &str,
        names: &HashMap<String, String>,
        result: LlmGroupResult,
    ) -> GroupSummary {
        let (slack_link, slack_links) = permalink::group_links(group);
        GroupSummary {
            narrative_summary: result.narrative_summary,
            start_time: group.start_time,
            end_time: group.end_time,
            message_count: group.total_message_count,
            user_messages: group.total_user_message_count,
            participants: display_participants(group, requesting_user, names),
            key_events: result.key_events,
            references: group.shared_references.clone(),
            outcome: result.outcome,
            next_actions: result.next_actions,
            timesheet_entry: timesheet_entry(group, &result.narrative_summary),
            slack_link,
            slack_links,
            segments_merged: group.segments_merged(),
        }
    }

    fn assemble_fallback(&self, group: &ConversationGroup, requesting_user: &str, names: &HashMap<String, String>) -> GroupSummary {
        let text = group.all_messages.iter().filter_map(|m| m.text.as_deref()).collect::<Vec<_>>().join(" ");
        let narrative = prompt::fallback_summary(&text);
        let (slack_link, slack_links) = permalink::group_links(group);
        GroupSummary {
            narrative_summary: narrative.clone(),
            start_time: group.start_time,
            end_time: group.end_time,
            message_count: group.total_message_count,
            user_messages: group.total_user_message_count,
            participants: display_participants(group, requesting_user, names),
            key_events: Vec::new(),
            references: group.shared_references.clone(),
            outcome: None,
            next_actions: Vec::new(),
            timesheet_entry: timesheet_entry(group, &narrative),
            slack_link,
            slack_links,
            segments_merged: group.segments_merged(),
        }
    }
}

fn display_participants(group: &ConversationGroup, requesting_user: &str, names: &HashMap<String, String>) -> Vec<String> {
    group
        .participants
        .iter()
        .filter(|p| *p != requesting_user)
        .map(|p| format!("@{}", names.get(p).cloned().unwrap_or_else(|| p.clone())))
        .collect()
}

fn timesheet_entry(group: &ConversationGroup, narrative: &str) -> String {
    let minutes = ((group.end_time - group.start_time) / 60.0).round().max(1.0);
    format!("{narrative} (~{minutes:.0} min)")
}

fn parse_single(raw: &str) -> Option<LlmGroupResult> {
    serde_json::from_str(extract_json_object(raw)).ok()
}

/// LLM output occasionally wraps the JSON in prose or a code fence; take the
/// outermost `{...}`/`[...]` span rather than requiring the whole response
/// to be pure JSON.
fn extract_json_object(raw: &str) -> &str {
    extract_span(raw, '{', '}')
}

fn extract_json_array(raw: &str) -> &str {
    extract_span(raw, '[', ']')
}

fn extract_span(raw: &str, open: char, close: char) -> &str {
    let start = raw.find(open);
    let end = raw.rfind(close);
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &raw[s..=e],
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::RetryPolicy;
    use crate::platform::fake::FakeChatPlatformClient;
    use crate::platform::Message;

    fn msg(ts: &str, user: &str, text: &str) -> Message {
        Message {
            ts: ts.to_string(),
            channel_id: "C1".to_string(),
            user: Some(user.to_string()),
            text: Some(text.to_string()),
            msg_type: "message".to_string(),
            subtype: None,
            thread_parent_ts: None,
            attachments: vec![],
        }
    }

    struct StaticLlm(String);
    #[async_trait::async_trait]
    impl LlmBackend for StaticLlm {
        async fn create_message(&self, _model: &str, _max_tokens: u32, _messages: &[LlmMessage]) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingLlm;
    #[async_trait::async_trait]
    impl LlmBackend for FailingLlm {
        async fn create_message(&self, _model: &str, _max_tokens: u32, _messages: &[LlmMessage]) -> anyhow::Result<String> {
            anyhow::bail!("rpc failed")
        }
    }

    fn group(id: &str, messages: Vec<Message>) -> ConversationGroup {
        use crate::model::Conversation;
        let conv = Conversation::from_messages(format!("{id}-c"), "C1", None, false, None, messages);
        ConversationGroup::from_conversations(id, vec![conv], vec![])
    }

    fn harness(llm: Arc<dyn LlmBackend>) -> Summarizer {
        let platform = Arc::new(FakeChatPlatformClient::new("U1"));
        let http = Arc::new(HttpClient::new(1000, RetryPolicy { max_retries: 0, initial_backoff_ms: 1, default_retry_after_secs: 0 }).unwrap());
        Summarizer::new(
            platform,
            http,
            llm,
            "claude-haiku-4-5-20251001".to_string(),
            SummarizerSettings::default(),
            Arc::new(Semaphore::new(4)),
        )
    }

    #[tokio::test]
    async fn single_group_parses_llm_json() {
        let llm = Arc::new(StaticLlm(
            r#"{"narrative_summary": "Fixed the login bug", "key_events": ["merged PR"], "outcome": "resolved", "next_actions": []}"#.to_string(),
        ));
        let summarizer = harness(llm);
        let g = group("g1", vec![msg("1.0", "U2", "working on the login bug")]);
        let results = summarizer.summarize_groups(vec![g], "U1").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].narrative_summary, "Fixed the login bug");
        assert_eq!(results[0].outcome.as_deref(), Some("resolved"));
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_word_stem_summary() {
        let summarizer = harness(Arc::new(FailingLlm));
        let g = group("g1", vec![msg("1.0", "U2", "deploy deploy deploy service migration")]);
        let results = summarizer.summarize_groups(vec![g], "U1").await;
        assert_eq!(results.len(), 1);
        assert!(results[0].narrative_summary.contains("deploy"));
    }

    #[tokio::test]
    async fn batch_size_mismatch_falls_back_to_individual_calls() {
        // Returns only 1 item for 3 groups -> driver must fall back.
        let llm = Arc::new(StaticLlm(r#"[{"narrative_summary": "only one"}]"#.to_string()));
        let summarizer = harness(llm);
        let groups = vec![
            group("g1", vec![msg("1.0", "U2", "alpha topic")]),
            group("g2", vec![msg("2.0", "U2", "beta topic")]),
            group("g3", vec![msg("3.0", "U2", "gamma topic")]),
        ];
        let results = summarizer.summarize_groups(groups, "U1").await;
        assert_eq!(results.len(), 3);
        // Every group falls back to the individual-call path; each of those
        // calls hits the same StaticLlm response, whose embedded object text
        // parses fine on its own, so all three come back non-empty.
        assert!(results.iter().all(|r| !r.narrative_summary.is_empty()));
    }

    #[test]
    fn extract_json_object_strips_surrounding_prose() {
        let raw = "Sure, here you go:\n{\"narrative_summary\": \"x\"}\nHope that helps!";
        assert_eq!(extract_json_object(raw), "{\"narrative_summary\": \"x\"}");
    }
}
