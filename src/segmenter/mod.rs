//! §4.E — Segmenter: turns a channel's raw messages into [`Conversation`]s.
//!
//! Five fixed stages: thread/main split, time-gap split, optional semantic
//! refinement (delegated to an injected [`SemanticBoundaryAnalyzer`] — see
//! DESIGN.md's open-question resolution on this point), sort, then context
//! enrichment from the full per-channel message list.

use std::collections::HashSet;

use chrono::TimeZone;
use chrono_tz::Tz;

use crate::model::Conversation;
use crate::platform::{Message, SUBTYPE_CONTEXT, SUBTYPE_MENTION_CONTEXT};

#[derive(Debug, Clone)]
pub struct SegmenterSettings {
    pub gap_threshold_minutes: f64,
    pub min_messages_for_semantic: usize,
    pub semantic_confidence_threshold: f64,
    pub max_mention_context_messages: usize,
    pub short_segment_threshold: usize,
    pub short_segment_target_size: usize,
    pub short_segment_max_gap_minutes: f64,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            gap_threshold_minutes: 60.0,
            min_messages_for_semantic: 3,
            semantic_confidence_threshold: 0.6,
            max_mention_context_messages: 20,
            short_segment_threshold: 2,
            short_segment_target_size: 10,
            short_segment_max_gap_minutes: 30.0,
        }
    }
}

/// A candidate split point within a time-gap segment, as returned by an
/// external semantic-boundary analyzer. `split_before_index` is an index
/// into the segment's message slice: the boundary falls immediately before
/// that message.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryDecision {
    pub split_before_index: usize,
    pub confidence: f64,
}

/// External semantic-boundary analysis (§4.E stage 3, §9 open question):
/// deterministic by contract so segmentation is reproducible. The core
/// ships no networked implementation; callers inject one (or none).
pub trait SemanticBoundaryAnalyzer: Send + Sync {
    fn analyze(&self, messages: &[Message]) -> Vec<BoundaryDecision>;
}

/// Segment `main_messages` (already known not to be thread replies) plus
/// `threads` (pre-fetched thread reply lists keyed by parent ts) into
/// time-sorted conversations, then enrich each with context from
/// `all_channel_messages`.
#[allow(clippy::too_many_arguments)]
pub fn segment(
    channel_id: &str,
    channel_name: Option<&str>,
    mut main_messages: Vec<Message>,
    threads: Vec<(String, Vec<Message>)>,
    all_channel_messages: &[Message],
    requesting_user: &str,
    settings: &SegmenterSettings,
    analyzer: Option<&dyn SemanticBoundaryAnalyzer>,
    timezone: Tz,
) -> Vec<Conversation> {
    // Stage 1 is the caller's responsibility for `main_messages` (it should
    // already exclude thread replies); we still defensively filter here so a
    // caller that forgot can't produce a bogus main-sequence segment.
    main_messages.retain(|m| !m.is_thread_reply());
    main_messages.sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());

    // Stage 2: time-gap split.
    let mut raw_segments: Vec<Vec<Message>> = Vec::new();
    let gap_seconds = settings.gap_threshold_minutes * 60.0;
    for msg in main_messages {
        match raw_segments.last_mut() {
            Some(seg) if (msg.ts_seconds() - seg.last().unwrap().ts_seconds()) < gap_seconds => {
                seg.push(msg);
            }
            _ => raw_segments.push(vec![msg]),
        }
    }

    // Stage 3: optional semantic refinement.
    let mut refined_segments: Vec<Vec<Message>> = Vec::new();
    for seg in raw_segments {
        if let Some(analyzer) = analyzer {
            if seg.len() >= settings.min_messages_for_semantic {
                let decisions = analyzer.analyze(&seg);
                refined_segments.extend(apply_boundaries(seg, &decisions, settings.semantic_confidence_threshold));
                continue;
            }
        }
        refined_segments.push(seg);
    }

    let mut conversations: Vec<Conversation> = refined_segments
        .into_iter()
        .enumerate()
        .map(|(i, msgs)| {
            Conversation::from_messages(
                format!("{channel_id}-seg-{i}"),
                channel_id,
                channel_name.map(str::to_string),
                false,
                None,
                msgs,
            )
        })
        .collect();

    for (parent_ts, replies) in threads {
        if replies.is_empty() {
            continue;
        }
        conversations.push(Conversation::from_messages(
            format!("{channel_id}-thread-{parent_ts}"),
            channel_id,
            channel_name.map(str::to_string),
            true,
            Some(parent_ts),
            replies,
        ));
    }

    // Stage 4: sort by start_time.
    conversations.sort_by(|a, b| a.start_time.partial_cmp(&b.start_time).unwrap());

    // Stage 5: context enrichment.
    for conv in &mut conversations {
        enrich_context(conv, all_channel_messages, requesting_user, settings, timezone);
    }

    conversations
}

fn apply_boundaries(segment: Vec<Message>, decisions: &[BoundaryDecision], threshold: f64) -> Vec<Vec<Message>> {
    let mut cut_points: Vec<usize> = decisions
        .iter()
        .filter(|d| d.confidence >= threshold && d.split_before_index > 0 && d.split_before_index < segment.len())
        .map(|d| d.split_before_index)
        .collect();
    cut_points.sort_unstable();
    cut_points.dedup();

    if cut_points.is_empty() {
        return vec![segment];
    }

    let mut out = Vec::new();
    let mut start = 0;
    for cut in cut_points {
        out.push(segment[start..cut].to_vec());
        start = cut;
    }
    out.push(segment[start..].to_vec());
    out
}

fn enrich_context(
    conv: &mut Conversation,
    all_channel_messages: &[Message],
    requesting_user: &str,
    settings: &SegmenterSettings,
    timezone: Tz,
) {
    let existing_ts: HashSet<String> = conv.messages.iter().map(|m| m.ts.clone()).collect();

    let first_message_author = conv.messages.first().and_then(|m| m.user.as_deref());
    let first_mention = conv
        .messages
        .iter()
        .find(|m| mentions_user(m, requesting_user));

    let mut added_mention_lookback = false;

    if let Some(first_mention) = first_mention {
        if first_message_author != Some(requesting_user) {
            let mention_ts = first_mention.ts_seconds();
            let day_start = start_of_local_day(mention_ts, timezone);

            let mut candidates: Vec<Message> = all_channel_messages
                .iter()
                .filter(|m| {
                    let t = m.ts_seconds();
                    t >= day_start && t < mention_ts && !existing_ts.contains(&m.ts) && !m.is_context()
                })
                .cloned()
                .collect();
            candidates.sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());

            let keep_from = candidates.len().saturating_sub(settings.max_mention_context_messages);
            for mut m in candidates.split_off(keep_from) {
                m.subtype = Some(SUBTYPE_MENTION_CONTEXT.to_string());
                conv.messages.push(m);
                added_mention_lookback = true;
            }
        }
    }

    if !added_mention_lookback
        && conv.user_message_count <= settings.short_segment_threshold
        && !conv.is_thread
    {
        let mut candidates: Vec<&Message> = all_channel_messages
            .iter()
            .filter(|m| m.ts_seconds() < conv.start_time && !existing_ts.contains(&m.ts))
            .collect();
        candidates.sort_by(|a, b| b.ts_seconds().partial_cmp(&a.ts_seconds()).unwrap());

        let mut to_add = Vec::new();
        let mut prev_ts = conv.start_time;
        for m in candidates {
            if to_add.len() + conv.messages.len() >= settings.short_segment_target_size {
                break;
            }
            let gap_minutes = (prev_ts - m.ts_seconds()) / 60.0;
            if gap_minutes > settings.short_segment_max_gap_minutes {
                break;
            }
            prev_ts = m.ts_seconds();
            to_add.push(m.clone());
        }
        for mut m in to_add {
            m.subtype = Some(SUBTYPE_CONTEXT.to_string());
            conv.messages.push(m);
        }
    }

    conv.resort_and_recompute();
}

fn mentions_user(message: &Message, user_id: &str) -> bool {
    message
        .text
        .as_deref()
        .map(|t| t.contains(&format!("<@{user_id}>")))
        .unwrap_or(false)
}

fn start_of_local_day(ts_seconds: f64, timezone: Tz) -> f64 {
    let utc = chrono::DateTime::from_timestamp(ts_seconds as i64, 0).unwrap_or_default();
    let local = timezone.from_utc_datetime(&utc.naive_utc());
    let day_start_local = local.date_naive().and_hms_opt(0, 0, 0).unwrap();
    timezone
        .from_local_datetime(&day_start_local)
        .single()
        .unwrap_or(local)
        .timestamp() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn time_gap_splits_into_separate_conversations() {
        let messages = vec![
            msg("0", "U1", "a"),
            msg("60", "U1", "b"),
            // gap of > 60 minutes
            msg("4000", "U1", "c"),
        ];
        let convs = segment(
            "C1",
            None,
            messages,
            vec![],
            &[],
            "U1",
            &SegmenterSettings::default(),
            None,
            chrono_tz::UTC,
        );
        assert_eq!(convs.len(), 2);
    }

    #[test]
    fn thread_replies_become_their_own_conversation() {
        let main = vec![msg("0", "U1", "a")];
        let threads = vec![("100".to_string(), vec![msg("101", "U2", "reply")])];
        let convs = segment(
            "C1",
            None,
            main,
            threads,
            &[],
            "U1",
            &SegmenterSettings::default(),
            None,
            chrono_tz::UTC,
        );
        assert_eq!(convs.len(), 2);
        assert!(convs.iter().any(|c| c.is_thread));
    }

    #[test]
    fn mention_lookback_adds_prior_context_and_marks_subtype() {
        let all_channel: Vec<Message> = vec![
            msg("32400", "U_other", "first"),
            msg("33000", "U_other", "second"),
            msg("33600", "U_other", "third"),
            msg("36000", "U_other", "<@U_req> check this out"),
            msg("36300", "U_req", "on it"),
        ];
        let main = vec![msg("36000", "U_other", "<@U_req> check this out"), msg("36300", "U_req", "on it")];

        let convs = segment(
            "C1",
            None,
            main,
            vec![],
            &all_channel,
            "U_req",
            &SegmenterSettings::default(),
            None,
            chrono_tz::UTC,
        );
        assert_eq!(convs.len(), 1);
        let conv = &convs[0];
        assert!(conv.messages.iter().any(|m| m.subtype.as_deref() == Some(SUBTYPE_MENTION_CONTEXT)));
        assert_eq!(conv.user_message_count, 2, "context messages must not count as user activity");
    }

    #[test]
    fn short_segment_expansion_only_when_no_mention_lookback() {
        let all_channel: Vec<Message> = vec![
            msg("0", "U1", "earlier one"),
            msg("60", "U1", "earlier two"),
        ];
        let main = vec![msg("120", "U1", "short reply")];
        let convs = segment(
            "C1",
            None,
            main,
            vec![],
            &all_channel,
            "U1",
            &SegmenterSettings::default(),
            None,
            chrono_tz::UTC,
        );
        assert_eq!(convs.len(), 1);
        assert!(convs[0].message_count > 1);
    }
}
