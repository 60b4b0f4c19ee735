//! §4.H step 2 — prompt construction, and the word-stem fallback summary
//! used when an LLM call or its JSON response fails (§4.H step 3, §7).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::ConversationGroup;
use crate::platform::Message;

static MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@([A-Za-z0-9]+)(?:\|[^>]*)?>").unwrap());

const INSTRUCTIONS: &str = "Write a first-person-omitted, past-tense narrative of what was actually \
discussed and done. Do not use generic phrases like \"discussed various topics\" or \"worked on things\" \
— name the specific subject matter, decisions, and outcomes. Do not restate these instructions.";

fn rewrite_mentions(text: &str, names: &HashMap<String, String>) -> String {
    MENTION_RE
        .replace_all(text, |caps: &regex::Captures| {
            let user_id = &caps[1];
            match names.get(user_id) {
                Some(name) => format!("@{name}"),
                None => format!("@{user_id}"),
            }
        })
        .to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push('…');
        truncated
    }
}

fn format_message(message: &Message, names: &HashMap<String, String>, max_chars: usize, attachment_max_chars: usize) -> String {
    let label = if message.is_bot_message() {
        "[Bot]".to_string()
    } else {
        match &message.user {
            Some(uid) => format!("[{}]", names.get(uid).cloned().unwrap_or_else(|| uid.clone())),
            None => "[unknown]".to_string(),
        }
    };

    let prefix = match message.subtype.as_deref() {
        Some(crate::platform::SUBTYPE_MENTION_CONTEXT) => "[PRIOR CONTEXT] ",
        Some(crate::platform::SUBTYPE_CONTEXT) => "[CONTEXT] ",
        _ => "",
    };

    let text = message.text.as_deref().unwrap_or("");
    let rewritten = rewrite_mentions(text, names);
    let truncated = truncate(&rewritten, max_chars);

    let mut line = format!("{prefix}{label}: {truncated}");

    for attachment in &message.attachments {
        let author = attachment
            .author_name
            .clone()
            .or_else(|| attachment.author_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let channel = attachment.channel_id.as_deref().unwrap_or("unknown channel");
        let body = attachment.text.as_deref().unwrap_or("");
        line.push_str(&format!("\n  > [shared from {channel} by {author}] {}", truncate(body, attachment_max_chars)));
    }

    line
}

/// §4.H step 2 group header: channel, time range, counts, participants,
/// shared refs.
fn build_header(group: &ConversationGroup, requesting_user: &str, names: &HashMap<String, String>) -> String {
    let participants: Vec<String> = group
        .participants
        .iter()
        .filter(|p| *p != requesting_user)
        .map(|p| format!("@{}", names.get(p).cloned().unwrap_or_else(|| p.clone())))
        .collect();

    format!(
        "Channel: {}\nTime range: {:.0} to {:.0}\nMessages: {} ({} from the user)\nParticipants: {}\nShared references: {}\n",
        group.conversations.first().and_then(|c| c.channel_name.clone()).unwrap_or_else(|| group.conversations.first().map(|c| c.channel_id.clone()).unwrap_or_default()),
        group.start_time,
        group.end_time,
        group.total_message_count,
        group.total_user_message_count,
        if participants.is_empty() { "(none)".to_string() } else { participants.join(", ") },
        if group.shared_references.is_empty() { "(none)".to_string() } else { group.shared_references.join(", ") },
    )
}

pub fn build_single_prompt(
    group: &ConversationGroup,
    requesting_user: &str,
    names: &HashMap<String, String>,
    max_message_chars: usize,
    attachment_max_chars: usize,
) -> String {
    let header = build_header(group, requesting_user, names);
    let body: String = group
        .all_messages
        .iter()
        .map(|m| format_message(m, names, max_message_chars, attachment_max_chars))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{INSTRUCTIONS}\n\nRespond with a JSON object: \
         {{\"narrative_summary\": string, \"key_events\": [string], \"outcome\": string|null, \"next_actions\": [string]}}\n\n\
         {header}\n{body}"
    )
}

pub fn build_batch_prompt(
    groups: &[&ConversationGroup],
    requesting_user: &str,
    names: &HashMap<String, String>,
    max_message_chars: usize,
    attachment_max_chars: usize,
) -> String {
    let mut sections = Vec::with_capacity(groups.len());
    for (idx, group) in groups.iter().enumerate() {
        let header = build_header(group, requesting_user, names);
        let body: String = group
            .all_messages
            .iter()
            .map(|m| format_message(m, names, max_message_chars, attachment_max_chars))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("=== Group {idx} ===\n{header}\n{body}"));
    }

    format!(
        "{INSTRUCTIONS}\n\nThere are {} groups below. Respond with a JSON array of exactly {} objects, \
         one per group in the same order, each shaped \
         {{\"narrative_summary\": string, \"key_events\": [string], \"outcome\": string|null, \"next_actions\": [string]}}\n\n{}",
        groups.len(),
        groups.len(),
        sections.join("\n\n")
    )
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "have", "has", "had", "was", "were", "are", "is",
    "a", "an", "to", "of", "in", "on", "at", "it", "we", "you", "i", "be", "been", "will", "would",
    "could", "should", "can", "did", "do", "does", "not", "but", "from", "about", "into", "just",
    "so", "up", "out", "as", "all", "some", "more", "also", "been", "there", "their", "our", "us",
];

/// Crude suffix-stripping stemmer: enough to group `deployed`/`deploying`
/// under `deploy` for the fallback's word-frequency ranking without pulling
/// in a full stemming crate for a degraded-mode code path.
fn stem(word: &str) -> String {
    let w = word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
    for suffix in ["ing", "ed", "es", "s"] {
        if w.len() > suffix.len() + 2 {
            if let Some(stripped) = w.strip_suffix(suffix) {
                return stripped.to_string();
            }
        }
    }
    w
}

/// §4.H step 3 / §7 fallback: a summary synthesized from the top-3
/// non-stopword word stems in the group's text, used whenever the LLM call
/// or its JSON parse fails.
pub fn fallback_summary(group_text: &str) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in group_text.split_whitespace() {
        let stemmed = stem(word);
        if stemmed.len() < 3 || STOPWORDS.contains(&stemmed.as_str()) {
            continue;
        }
        *counts.entry(stemmed).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top: Vec<String> = ranked.into_iter().take(3).map(|(w, _)| w).collect();

    if top.is_empty() {
        "Worked on miscellaneous items; logged time accordingly.".to_string()
    } else {
        format!("Worked on {}; logged time accordingly.", top.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_rewritten_to_display_name() {
        let mut names = HashMap::new();
        names.insert("U123".to_string(), "Alice".to_string());
        assert_eq!(rewrite_mentions("hey <@U123> check this", &names), "hey @Alice check this");
    }

    #[test]
    fn mention_falls_back_to_bare_id_when_unresolved() {
        let names = HashMap::new();
        assert_eq!(rewrite_mentions("hey <@U999>", &names), "hey @U999");
    }

    #[test]
    fn truncate_respects_char_limit() {
        let long = "x".repeat(10);
        assert_eq!(truncate(&long, 5).chars().count(), 6); // 5 chars + ellipsis
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn fallback_summary_picks_top_words() {
        let text = "deploy deploy deploy service service migration";
        let summary = fallback_summary(text);
        assert!(summary.contains("deploy"));
        assert!(summary.contains("service"));
    }

    #[test]
    fn fallback_summary_handles_empty_text() {
        let summary = fallback_summary("");
        assert!(summary.contains("Worked on"));
    }
}
