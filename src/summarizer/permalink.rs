//! §4.H step 5 — permalink enrichment and linked-message attachment
//! synthesis. Both are best-effort: a failed RPC degrades to a channel-level
//! fallback link or simply skips the synthesized attachment rather than
//! failing the whole summarization pass.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::http_client::HttpClient;
use crate::model::ConversationGroup;
use crate::platform::{Attachment, ChatPlatformClient};
use crate::references::extractors::extract;
use crate::references::ReferenceType;

/// Fetch a permalink for each conversation's first message (bounded
/// parallel), and synthesize attachments for any intra-platform message
/// links in the group's text that the platform didn't already unfurl.
pub async fn enrich_groups(
    platform: &Arc<dyn ChatPlatformClient>,
    http: &Arc<HttpClient>,
    groups: &mut [ConversationGroup],
    concurrency: usize,
) {
    for group in groups.iter_mut() {
        enrich_permalinks(platform, http, group, concurrency).await;
        enrich_linked_attachments(platform, http, group, concurrency).await;
    }
}

async fn enrich_permalinks(
    platform: &Arc<dyn ChatPlatformClient>,
    http: &Arc<HttpClient>,
    group: &mut ConversationGroup,
    concurrency: usize,
) {
    let targets: Vec<(usize, String, String)> = group
        .conversations
        .iter()
        .enumerate()
        .filter_map(|(idx, conv)| conv.messages.first().map(|m| (idx, conv.channel_id.clone(), m.ts.clone())))
        .collect();

    let fetched = stream::iter(targets)
        .map(|(idx, channel_id, ts)| {
            let platform = platform.clone();
            let http = http.clone();
            async move {
                let link = http
                    .execute(|| async { platform.permalink(&channel_id, &ts).await })
                    .await
                    .unwrap_or_else(|_| format!("https://app.slack.com/client/{channel_id}"));
                (idx, link)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    for (idx, link) in fetched {
        if let Some(conv) = group.conversations.get_mut(idx) {
            conv.permalink = Some(link);
        }
    }
}

/// Every `slack_message` reference in the group's text whose target message
/// lacks a platform-unfurled attachment already gets one synthesized here,
/// so the prompt can quote the linked message's content instead of a bare
/// URL (§4.H step 5).
async fn enrich_linked_attachments(
    platform: &Arc<dyn ChatPlatformClient>,
    http: &Arc<HttpClient>,
    group: &mut ConversationGroup,
    concurrency: usize,
) {
    let mut links_by_message: Vec<(usize, usize, String, String)> = Vec::new();
    for (mi, message) in group.all_messages.iter().enumerate() {
        let Some(text) = &message.text else { continue };
        if message.attachments.iter().any(|a| a.is_unfurl) {
            continue;
        }
        for (ri, reference) in extract(text, &message.ts).into_iter().enumerate() {
            if reference.ref_type != ReferenceType::SlackMessage {
                continue;
            }
            let Some((channel, ts)) = parse_slack_value(&reference.value) else { continue };
            links_by_message.push((mi, ri, channel, ts));
        }
    }
    if links_by_message.is_empty() {
        return;
    }

    let cache: Arc<AsyncMutex<HashMap<(String, String), Option<Attachment>>>> = Arc::new(AsyncMutex::new(HashMap::new()));

    let fetched = stream::iter(links_by_message)
        .map(|(mi, ri, channel, ts)| {
            let platform = platform.clone();
            let http = http.clone();
            let cache = cache.clone();
            async move {
                let key = (channel.clone(), ts.clone());
                if let Some(cached) = cache.lock().await.get(&key).cloned() {
                    return (mi, ri, cached);
                }
                let fetched = http
                    .execute(|| async { platform.get_message(&channel, &ts).await })
                    .await
                    .ok()
                    .flatten()
                    .map(|linked| Attachment {
                        author_id: linked.user.clone(),
                        author_name: None,
                        channel_id: Some(channel.clone()),
                        text: linked.text.clone(),
                        is_unfurl: true,
                    });
                cache.lock().await.insert(key, fetched.clone());
                (mi, ri, fetched)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    for (mi, _ri, attachment) in fetched {
        if let Some(attachment) = attachment {
            if let Some(message) = group.all_messages.get_mut(mi) {
                message.attachments.push(attachment);
            }
        }
    }
}

fn parse_slack_value(value: &str) -> Option<(String, String)> {
    let mut parts = value.splitn(3, ':');
    if parts.next()? != "slack" {
        return None;
    }
    let channel = parts.next()?.to_string();
    let ts = parts.next()?.to_string();
    Some((channel, ts))
}

/// The group's primary link (first conversation's permalink, falling back to
/// a bare channel link) and the full set of distinct conversation links,
/// used for the digest's `slack_link`/`slack_links` fields.
pub fn group_links(group: &ConversationGroup) -> (String, Vec<String>) {
    let mut links: Vec<String> = group.conversations.iter().filter_map(|c| c.permalink.clone()).collect();
    links.dedup();
    let primary = links.first().cloned().unwrap_or_else(|| {
        group
            .conversations
            .first()
            .map(|c| format!("https://app.slack.com/client/{}", c.channel_id))
            .unwrap_or_default()
    });
    (primary, links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpClient, RetryPolicy};
    use crate::model::Conversation;
    use crate::platform::fake::FakeChatPlatformClient;
    use crate::platform::Message;

    fn msg(ts: &str, text: &str) -> Message {
        Message {
            ts: ts.to_string(),
            channel_id: "C1".to_string(),
            user: Some("U1".to_string()),
            text: Some(text.to_string()),
            msg_type: "message".to_string(),
            subtype: None,
            thread_parent_ts: None,
            attachments: vec![],
        }
    }

    fn http() -> Arc<HttpClient> {
        Arc::new(HttpClient::new(1000, RetryPolicy { max_retries: 0, initial_backoff_ms: 1, default_retry_after_secs: 0 }).unwrap())
    }

    #[tokio::test]
    async fn permalink_enrichment_sets_conversation_link() {
        let fake = FakeChatPlatformClient::new("U1");
        fake.permalinks
            .lock()
            .unwrap()
            .insert(("C1".to_string(), "1.0".to_string()), "https://example.slack.com/archives/C1/p1000000".to_string());
        let platform: Arc<dyn ChatPlatformClient> = Arc::new(fake);
        let http = http();

        let conv = Conversation::from_messages("c1", "C1", None, false, None, vec![msg("1.0", "hello")]);
        let mut group = ConversationGroup::from_conversations("g1", vec![conv], vec![]);

        enrich_permalinks(&platform, &http, &mut group, 4).await;
        assert_eq!(group.conversations[0].permalink.as_deref(), Some("https://example.slack.com/archives/C1/p1000000"));
    }

    #[tokio::test]
    async fn permalink_failure_falls_back_to_channel_link() {
        let mut fake = FakeChatPlatformClient::new("U1");
        fake.permalink_should_fail = true;
        let platform: Arc<dyn ChatPlatformClient> = Arc::new(fake);
        let http = http();

        let conv = Conversation::from_messages("c1", "C1", None, false, None, vec![msg("1.0", "hello")]);
        let mut group = ConversationGroup::from_conversations("g1", vec![conv], vec![]);

        enrich_permalinks(&platform, &http, &mut group, 4).await;
        assert!(group.conversations[0].permalink.as_deref().unwrap().contains("C1"));
    }

    #[tokio::test]
    async fn linked_message_gets_synthesized_attachment() {
        let mut fake = FakeChatPlatformClient::new("U1");
        fake.history.insert(
            "C2".to_string(),
            vec![Message {
                ts: "1700000000.000100".to_string(),
                channel_id: "C2".to_string(),
                user: Some("U9".to_string()),
                text: Some("the original context".to_string()),
                msg_type: "message".to_string(),
                subtype: None,
                thread_parent_ts: None,
                attachments: vec![],
            }],
        );
        let platform: Arc<dyn ChatPlatformClient> = Arc::new(fake);
        let http = http();

        let conv = Conversation::from_messages(
            "c1",
            "C1",
            None,
            false,
            None,
            vec![msg("1.0", "see https://example.slack.com/archives/C2/p1700000000000100")],
        );
        let mut group = ConversationGroup::from_conversations("g1", vec![conv], vec![]);

        enrich_linked_attachments(&platform, &http, &mut group, 4).await;
        assert_eq!(group.all_messages[0].attachments.len(), 1);
        assert_eq!(group.all_messages[0].attachments[0].text.as_deref(), Some("the original context"));
    }

    #[test]
    fn group_links_dedupes_and_falls_back() {
        let conv = Conversation::from_messages("c1", "C1", None, false, None, vec![msg("1.0", "hi")]);
        let group = ConversationGroup::from_conversations("g1", vec![conv], vec![]);
        let (primary, links) = group_links(&group);
        assert!(primary.contains("C1"));
        assert!(links.is_empty());
    }
}
