//! §4.D — Reference extractor and similarity support.
//!
//! A `Reference` is a typed, normalized mention of an external resource
//! (ticket, PR, doc, mentioned user...) found in message text. The closed
//! set of types is fixed; extraction and normalization contracts live in
//! [`extractors`]. `refs_for_similarity`/`jaccard` feed the consolidator's
//! hybrid similarity score (§4.F).

pub mod extractors;
pub mod normalize;

use std::collections::HashSet;

use crate::model::Conversation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    GithubIssue,
    GithubPr,
    GithubUrl,
    Gitlab,
    Ticket,
    Confluence,
    Notion,
    Gdoc,
    Gsheet,
    Gslide,
    Figma,
    Asana,
    Clickup,
    Sentry,
    Datadog,
    Pagerduty,
    AwsLogGroup,
    Zendesk,
    Salesforce,
    ErrorPattern,
    UserMention,
    ServiceName,
    SlackMessage,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GithubIssue => "github_issue",
            Self::GithubPr => "github_pr",
            Self::GithubUrl => "github_url",
            Self::Gitlab => "gitlab",
            Self::Ticket => "ticket",
            Self::Confluence => "confluence",
            Self::Notion => "notion",
            Self::Gdoc => "gdoc",
            Self::Gsheet => "gsheet",
            Self::Gslide => "gslide",
            Self::Figma => "figma",
            Self::Asana => "asana",
            Self::Clickup => "clickup",
            Self::Sentry => "sentry",
            Self::Datadog => "datadog",
            Self::Pagerduty => "pagerduty",
            Self::AwsLogGroup => "aws_log_group",
            Self::Zendesk => "zendesk",
            Self::Salesforce => "salesforce",
            Self::ErrorPattern => "error_pattern",
            Self::UserMention => "user_mention",
            Self::ServiceName => "service_name",
            Self::SlackMessage => "slack_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub ref_type: ReferenceType,
    pub value: String,
    pub raw: String,
    pub message_ts: String,
}

#[derive(Debug, Clone)]
pub struct ConversationReferences {
    pub conversation_id: String,
    pub references: Vec<Reference>,
    pub unique_values: HashSet<String>,
}

impl ConversationReferences {
    /// Extract references from every message in `conv`, in ts order.
    pub fn extract(conv: &Conversation) -> Self {
        let mut references = Vec::new();
        for message in &conv.messages {
            if let Some(text) = &message.text {
                references.extend(extractors::extract(text, &message.ts));
            }
        }
        let unique_values = references.iter().map(|r| r.value.clone()).collect();
        Self {
            conversation_id: conv.id.clone(),
            references,
            unique_values,
        }
    }

    /// The subset of values used for topical similarity — excludes
    /// `user_mention`, since two conversations mentioning the same person
    /// isn't evidence they're about the same topic.
    pub fn refs_for_similarity(&self) -> HashSet<String> {
        self.references
            .iter()
            .filter(|r| r.ref_type != ReferenceType::UserMention)
            .map(|r| r.value.clone())
            .collect()
    }
}

/// Jaccard similarity of two sets: `|A ∩ B| / |A ∪ B|`, `0.0` when both are
/// empty (no shared evidence either way, not "identical").
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn conversation_references_dedupe_at_unique_values() {
        let conv = Conversation::from_messages(
            "c1",
            "C1",
            None,
            false,
            None,
            vec![msg("1.0", "see #42"), msg("2.0", "still on #42")],
        );
        let refs = ConversationReferences::extract(&conv);
        assert_eq!(refs.references.len(), 2);
        assert_eq!(refs.unique_values.len(), 1);
    }

    #[test]
    fn refs_for_similarity_excludes_user_mention() {
        let conv = Conversation::from_messages(
            "c1",
            "C1",
            None,
            false,
            None,
            vec![msg("1.0", "hey <@U99> check #42")],
        );
        let refs = ConversationReferences::extract(&conv);
        let sim = refs.refs_for_similarity();
        assert!(sim.contains("#42"));
        assert!(!sim.contains("U99"));
    }

    #[test]
    fn jaccard_both_empty_is_zero() {
        let a = HashSet::new();
        let b = HashSet::new();
        assert_eq!(jaccard(&a, &b), 0.0);
    }

    #[test]
    fn jaccard_computes_intersection_over_union() {
        let a: HashSet<String> = ["#1", "#2"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["#2", "#3"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - (1.0 / 3.0)).abs() < 1e-9);
    }
}
