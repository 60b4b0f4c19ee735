//! §4.G — Consolidator. Runs per-channel on the segmenter's output: bot
//! merge, trivial merge/orphan-drop, then a union-find pass over four merge
//! strategies (adjacent, proximity, same-author, similarity), producing
//! [`ConversationGroup`]s.

mod union_find;

use std::collections::HashSet;

use crate::embedding::{self, EmbeddingLookup};
use crate::model::{Conversation, ConversationGroup};
use crate::references::{jaccard, ConversationReferences};

use union_find::UnionFind;

const WORK_INDICATORS: &[&str] = &[
    "confirm", "verified", "tested", "checked", "fixed", "done", "complete", "approved",
    "reviewed", "resolved", "merged", "deployed", "updated", "shipped", "launched", "released",
];

#[derive(Debug, Clone)]
pub struct ConsolidatorSettings {
    pub bot_merge_window_minutes: f64,
    pub trivial_max_messages: usize,
    pub trivial_max_characters: usize,
    pub trivial_merge_window_minutes: f64,
    pub trivial_drop_orphans: bool,
    pub adjacent_merge_window_minutes: f64,
    pub proximity_dm_window_minutes: f64,
    pub proximity_dm_min_similarity: f64,
    pub proximity_window_minutes: f64,
    pub proximity_min_similarity: f64,
    pub same_author_max_gap_minutes: f64,
    pub same_author_min_similarity: f64,
    pub similarity_max_gap_minutes: f64,
    pub similarity_threshold: f64,
    pub participant_jaccard_same_author_threshold: f64,
    pub reference_weight: f64,
    pub embedding_weight: f64,
}

impl Default for ConsolidatorSettings {
    fn default() -> Self {
        Self {
            bot_merge_window_minutes: 30.0,
            trivial_max_messages: 2,
            trivial_max_characters: 100,
            trivial_merge_window_minutes: 30.0,
            trivial_drop_orphans: true,
            adjacent_merge_window_minutes: 15.0,
            proximity_dm_window_minutes: 180.0,
            proximity_dm_min_similarity: 0.05,
            proximity_window_minutes: 90.0,
            proximity_min_similarity: 0.20,
            same_author_max_gap_minutes: 360.0,
            same_author_min_similarity: 0.20,
            similarity_max_gap_minutes: 240.0,
            similarity_threshold: 0.40,
            participant_jaccard_same_author_threshold: 0.7,
            reference_weight: 0.6,
            embedding_weight: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationStats {
    pub bots_merged: usize,
    pub trivials_merged: usize,
    pub trivials_dropped: usize,
    pub adjacent_merges: usize,
    pub proximity_merges: usize,
    pub same_author_merges: usize,
    pub similarity_merges: usize,
}

pub struct ConsolidationResult {
    pub groups: Vec<ConversationGroup>,
    pub stats: ConsolidationStats,
}

/// Run the full consolidation pipeline over one channel's segmented
/// conversations, in ts order (caller's responsibility — the segmenter
/// already sorts by `start_time`).
pub fn consolidate(
    conversations: Vec<Conversation>,
    requesting_user: &str,
    settings: &ConsolidatorSettings,
    embeddings: &EmbeddingLookup,
) -> ConsolidationResult {
    let mut stats = ConsolidationStats::default();

    let conversations = merge_bots(conversations, settings, &mut stats);
    let conversations = merge_trivial(conversations, settings, &mut stats);

    let refs: Vec<ConversationReferences> = conversations.iter().map(ConversationReferences::extract).collect();

    let n = conversations.len();
    let mut uf = UnionFind::new(n);

    for i in 0..n {
        for j in (i + 1)..n {
            let a = &conversations[i];
            let b = &conversations[j];
            let gap_minutes = time_gap_minutes(a, b);
            let same_author = is_same_author(a, b, requesting_user, settings);
            let score = hybrid_score(a, b, &refs[i], &refs[j], embeddings, settings);

            if gap_minutes <= settings.adjacent_merge_window_minutes {
                if uf.union(i, j) {
                    stats.adjacent_merges += 1;
                }
                continue;
            }

            if same_author {
                let (window, threshold) = if a.channel_id.starts_with('D') && b.channel_id.starts_with('D') {
                    (settings.proximity_dm_window_minutes, settings.proximity_dm_min_similarity)
                } else {
                    (settings.proximity_window_minutes, settings.proximity_min_similarity)
                };
                if gap_minutes <= window && score >= threshold {
                    if uf.union(i, j) {
                        stats.proximity_merges += 1;
                    }
                    continue;
                }

                if gap_minutes <= settings.same_author_max_gap_minutes && score >= settings.same_author_min_similarity {
                    if uf.union(i, j) {
                        stats.same_author_merges += 1;
                    }
                    continue;
                }
            }

            if gap_minutes <= settings.similarity_max_gap_minutes && score >= settings.similarity_threshold {
                if uf.union(i, j) {
                    stats.similarity_merges += 1;
                }
            }
        }
    }

    let mut by_root: std::collections::HashMap<usize, Vec<usize>> = std::collections::HashMap::new();
    for idx in 0..n {
        by_root.entry(uf.find(idx)).or_default().push(idx);
    }

    let mut groups = Vec::with_capacity(by_root.len());
    for (root, members) in by_root {
        let mut shared: HashSet<String> = HashSet::new();
        for &m in &members {
            shared.extend(refs[m].unique_values.iter().cloned());
        }
        let mut shared: Vec<String> = shared.into_iter().collect();
        shared.sort();

        let group_conversations: Vec<Conversation> = members
            .iter()
            .map(|&i| conversations[i].clone())
            .collect();
        groups.push(ConversationGroup::from_conversations(
            format!("group-{root}"),
            group_conversations,
            shared,
        ));
    }
    groups.sort_by(|a, b| a.start_time.partial_cmp(&b.start_time).unwrap());

    ConsolidationResult { groups, stats }
}

fn time_gap_minutes(a: &Conversation, b: &Conversation) -> f64 {
    let (earlier, later) = if a.start_time <= b.start_time { (a, b) } else { (b, a) };
    ((later.start_time - earlier.end_time).abs()) / 60.0
}

fn is_same_author(a: &Conversation, b: &Conversation, requesting_user: &str, settings: &ConsolidatorSettings) -> bool {
    if a.participants.contains(&requesting_user.to_string()) && b.participants.contains(&requesting_user.to_string()) {
        return true;
    }
    if a.participants.len() == 1 && b.participants.len() == 1 && a.participants == b.participants {
        return true;
    }
    let a_set: HashSet<String> = a.participants.iter().cloned().collect();
    let b_set: HashSet<String> = b.participants.iter().cloned().collect();
    jaccard(&a_set, &b_set) >= settings.participant_jaccard_same_author_threshold
}

fn hybrid_score(
    a: &Conversation,
    b: &Conversation,
    refs_a: &ConversationReferences,
    refs_b: &ConversationReferences,
    embeddings: &EmbeddingLookup,
    settings: &crate::consolidator::ConsolidatorSettings,
) -> f64 {
    embedding::hybrid_similarity_weighted(
        &refs_a.refs_for_similarity(),
        &refs_b.refs_for_similarity(),
        embeddings.get(&a.id),
        embeddings.get(&b.id),
        settings.reference_weight,
        settings.embedding_weight,
    )
}

fn merge_bots(conversations: Vec<Conversation>, settings: &ConsolidatorSettings, stats: &mut ConsolidationStats) -> Vec<Conversation> {
    let mut out: Vec<Conversation> = Vec::with_capacity(conversations.len());
    for conv in conversations {
        if conv.is_bot_conversation() && !out.is_empty() {
            let prev_gap = time_gap_minutes(out.last().unwrap(), &conv);
            if prev_gap <= settings.bot_merge_window_minutes {
                let last = out.last_mut().unwrap();
                last.messages.extend(conv.messages);
                last.resort_and_recompute();
                stats.bots_merged += 1;
                continue;
            }
        }
        out.push(conv);
    }

    // Second pass: absorb into the *next* non-bot conversation when there
    // was no eligible previous one (§4.G: "prefer the previous non-bot,
    // else the next").
    let mut result: Vec<Conversation> = Vec::with_capacity(out.len());
    let mut i = 0;
    while i < out.len() {
        if out[i].is_bot_conversation() && i + 1 < out.len() {
            let gap = time_gap_minutes(&out[i], &out[i + 1]);
            if gap <= settings.bot_merge_window_minutes {
                out[i + 1].messages.extend(out[i].messages.clone());
                out[i + 1].resort_and_recompute();
                stats.bots_merged += 1;
                i += 1;
                continue;
            }
        }
        result.push(out[i].clone());
        i += 1;
    }
    result
}

fn merge_trivial(conversations: Vec<Conversation>, settings: &ConsolidatorSettings, stats: &mut ConsolidationStats) -> Vec<Conversation> {
    let is_trivial = |c: &Conversation| {
        c.message_count <= settings.trivial_max_messages && c.joined_text().len() < settings.trivial_max_characters
    };

    let mut out: Vec<Conversation> = Vec::with_capacity(conversations.len());
    for conv in conversations {
        if !is_trivial(&conv) {
            out.push(conv);
            continue;
        }

        let prev_distance = out.last().map(|p| time_gap_minutes(p, &conv));
        if let Some(d) = prev_distance {
            if d <= settings.trivial_merge_window_minutes {
                let prev = out.last_mut().unwrap();
                prev.messages.extend(conv.messages);
                prev.resort_and_recompute();
                stats.trivials_merged += 1;
                continue;
            }
        }

        let has_work_indicator = {
            let text = conv.joined_text().to_lowercase();
            WORK_INDICATORS.iter().any(|w| text.contains(w))
        };

        if settings.trivial_drop_orphans && !has_work_indicator {
            stats.trivials_dropped += 1;
            continue;
        }

        out.push(conv);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingLookup;
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

    fn bot_msg(ts: &str, text: &str) -> Message {
        Message {
            ts: ts.to_string(),
            channel_id: "C1".to_string(),
            user: None,
            text: Some(text.to_string()),
            msg_type: "message".to_string(),
            subtype: Some(crate::platform::SUBTYPE_BOT_MESSAGE.to_string()),
            thread_parent_ts: None,
            attachments: vec![],
        }
    }

    fn conv(id: &str, messages: Vec<Message>) -> Conversation {
        Conversation::from_messages(id, "C1", None, false, None, messages)
    }

    #[test]
    fn adjacent_merge_across_users() {
        let a = conv("a", vec![msg("36000", "U1", "x"), msg("36300", "U1", "y")]); // 10:00-10:05
        let b = conv("b", vec![msg("36900", "U2", "z"), msg("37200", "U2", "w")]); // 10:15-10:20
        let result = consolidate(vec![a, b], "U1", &ConsolidatorSettings::default(), &EmbeddingLookup::empty());
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].conversations.len(), 2);
        assert_eq!(result.stats.adjacent_merges, 1);
    }

    #[test]
    fn bot_absorption_into_previous_human_conversation() {
        let human = conv(
            "h1",
            vec![
                msg("36000", "H1", "a"),
                msg("36060", "H1", "b"),
                msg("36120", "H1", "c"),
                msg("36180", "H1", "d"),
                msg("36300", "H1", "e"),
            ],
        );
        let bot = conv("b1", vec![bot_msg("36360", "Deployment complete"), bot_msg("36480", "all good")]);
        let result = consolidate(vec![human, bot], "H1", &ConsolidatorSettings::default(), &EmbeddingLookup::empty());
        assert_eq!(result.stats.bots_merged, 1);
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].total_message_count, 7);
    }

    #[test]
    fn trivial_orphan_dropped_without_work_indicator() {
        let trivial = conv("t1", vec![msg("50000", "U1", "ok")]);
        let result = consolidate(vec![trivial], "U1", &ConsolidatorSettings::default(), &EmbeddingLookup::empty());
        assert_eq!(result.groups.len(), 0);
        assert_eq!(result.stats.trivials_dropped, 1);
    }

    #[test]
    fn trivial_kept_with_work_indicator() {
        let trivial = conv("t1", vec![msg("50000", "U1", "merged")]);
        let result = consolidate(vec![trivial], "U1", &ConsolidatorSettings::default(), &EmbeddingLookup::empty());
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.stats.trivials_dropped, 0);
    }

    #[test]
    fn same_author_cross_hour_merge_via_shared_reference() {
        let a = conv("a", vec![msg("36000", "U1", "Working on #123"), msg("36900", "U1", "more")]);
        let b = conv("b", vec![msg("43200", "U1", "Continuing #123 work"), msg("44100", "U1", "more2")]);
        let result = consolidate(vec![a, b], "U1", &ConsolidatorSettings::default(), &EmbeddingLookup::empty());
        assert_eq!(result.groups.len(), 1, "shared reference under same-author path should merge");
    }

    #[test]
    fn reference_transitivity_across_three_conversations() {
        let a = conv("a", vec![msg("0", "U1", "see #123")]);
        let b = conv("b", vec![msg("3600", "U2", "re #123 and AUTH-456")]);
        let c = conv("c", vec![msg("7200", "U3", "closing AUTH-456")]);
        let result = consolidate(vec![a, b, c], "U1", &ConsolidatorSettings::default(), &EmbeddingLookup::empty());
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].conversations.len(), 3);
    }
}
