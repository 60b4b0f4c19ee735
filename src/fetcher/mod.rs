//! §4.C — Fetcher. Turns a `(user_id?, time_range)` request into a
//! [`UserActivityData`] bundle: active channels, per-channel message history
//! (extended 24h for lookback context), thread replies, mentions, and
//! reactions — all cache-aware, fanning out across channels with bounded
//! concurrency (grounded on `backend/src/memory/features/embedding.rs`'s
//! batched retry loop and `hybrid_search.rs`'s `try_join!` parallel fetch).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::cache::{CacheStore, WatermarkKind};
use crate::error::Result;
use crate::http_client::HttpClient;
use crate::platform::{Channel, ChatPlatformClient, Message, Reaction, TimeRange};

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub slack_concurrency: usize,
    pub lookback_hours: f64,
    pub skip_cache: bool,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            slack_concurrency: 10,
            lookback_hours: 24.0,
            skip_cache: false,
        }
    }
}

/// A thread the requesting user participated in, with replies already
/// filtered to those within the original (non-lookback) range (§4.C phase 4).
#[derive(Debug, Clone)]
pub struct ThreadParticipation {
    pub channel_id: String,
    pub thread_parent_ts: String,
    pub replies: Vec<Message>,
}

/// The fetcher's output (§4.C "Output"): everything downstream stages need,
/// per channel, plus the classified "sent by user" subset and thread/mention/
/// reaction side-channels.
#[derive(Debug, Clone, Default)]
pub struct UserActivityData {
    pub user_id: String,
    pub channels: Vec<Channel>,
    /// Full per-channel message list across the *extended* (lookback) range
    /// — used downstream by the segmenter for context enrichment.
    pub channel_messages: HashMap<String, Vec<Message>>,
    /// Messages authored by the user with ts in the *original* range only
    /// (§4.C phase 3: "sent by user" never counts lookback messages).
    pub messages_sent: Vec<Message>,
    pub threads_participated: Vec<ThreadParticipation>,
    pub mentions: Vec<Message>,
    pub reactions: Vec<Reaction>,
}

pub struct Fetcher {
    platform: Arc<dyn ChatPlatformClient>,
    cache: Arc<CacheStore>,
    http: Arc<HttpClient>,
    settings: FetcherSettings,
}

impl Fetcher {
    pub fn new(
        platform: Arc<dyn ChatPlatformClient>,
        cache: Arc<CacheStore>,
        http: Arc<HttpClient>,
        settings: FetcherSettings,
    ) -> Self {
        Self { platform, cache, http, settings }
    }

    /// Run the full fetch pipeline (§4.C phases 1-6) for `user_id` (or the
    /// current authenticated user when absent) over `range`.
    pub async fn fetch(&self, user_id: Option<&str>, range: TimeRange) -> Result<UserActivityData> {
        let user_id = match user_id {
            Some(u) => u.to_string(),
            None => self.http.execute(|| async { self.platform.current_user().await }).await?,
        };

        // Phase 1: active-channel discovery.
        let (mut active_channel_ids, thread_hints) = self.discover_active_channels(&user_id, range).await?;

        let lookback_range = range.extended_lookback(self.settings.lookback_hours);

        // Phase 2: channel history, fanned out with bounded concurrency.
        // Per-channel errors are logged and the channel is simply omitted
        // (§4.C "Failure semantics": per-channel errors fail that channel).
        active_channel_ids.sort();
        active_channel_ids.dedup();
        let concurrency = self.settings.slack_concurrency.max(1);
        let results: Vec<(String, Option<Vec<Message>>)> = stream::iter(active_channel_ids.iter().cloned())
            .map(|channel_id| {
                let channel_id2 = channel_id.clone();
                async move {
                    match self.fetch_channel_history(&channel_id, &user_id, lookback_range).await {
                        Ok(messages) => (channel_id2, Some(messages)),
                        Err(err) => {
                            warn!(channel_id = %channel_id2, error = %err, "channel history fetch failed, omitting channel");
                            (channel_id2, None)
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut channel_messages: HashMap<String, Vec<Message>> = HashMap::new();
        let mut channels = Vec::new();
        for (channel_id, messages) in results {
            if let Some(messages) = messages {
                channel_messages.insert(channel_id.clone(), messages);
                if let Ok(info) = self.fetch_channel_info(&channel_id).await {
                    channels.push(info);
                }
            }
        }

        // Phase 3: within/outside-range classification.
        let mut messages_sent = Vec::new();
        for messages in channel_messages.values() {
            for m in messages {
                if m.user.as_deref() == Some(user_id.as_str()) && range.contains(m.ts_seconds()) {
                    messages_sent.push(m.clone());
                }
            }
        }
        messages_sent.sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());

        // Collect (channel, thread_parent_ts) pairs: from thread hints found
        // during search, plus any reply-by-user discovered in channel history.
        let mut thread_keys: HashSet<(String, String)> = thread_hints;
        for (channel_id, messages) in &channel_messages {
            for m in messages {
                if m.is_thread_reply() && m.user.as_deref() == Some(user_id.as_str()) && range.contains(m.ts_seconds()) {
                    if let Some(parent) = &m.thread_parent_ts {
                        thread_keys.insert((channel_id.clone(), parent.clone()));
                    }
                }
            }
        }

        // Phase 4: thread replies, fetched live (never cached — threads mutate).
        let thread_keys: Vec<(String, String)> = thread_keys.into_iter().collect();
        let thread_results: Vec<Option<ThreadParticipation>> = stream::iter(thread_keys)
            .map(|(channel_id, parent_ts)| async move {
                match self
                    .http
                    .execute(|| async { self.platform.thread_replies(&channel_id, &parent_ts).await })
                    .await
                {
                    Ok(replies) => {
                        let filtered: Vec<Message> =
                            replies.into_iter().filter(|m| range.contains(m.ts_seconds())).collect();
                        if filtered.is_empty() {
                            None
                        } else {
                            Some(ThreadParticipation {
                                channel_id,
                                thread_parent_ts: parent_ts,
                                replies: filtered,
                            })
                        }
                    }
                    Err(err) => {
                        warn!(channel_id = %channel_id, parent_ts = %parent_ts, error = %err, "thread replies fetch failed");
                        None
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        let threads_participated: Vec<ThreadParticipation> = thread_results.into_iter().flatten().collect();

        // Phase 5: mentions.
        let mentions = self.fetch_mentions(&user_id, range).await?;

        // Phase 6: reactions.
        let reactions = self.fetch_reactions(&user_id, range).await?;

        Ok(UserActivityData {
            user_id,
            channels,
            channel_messages,
            messages_sent,
            threads_participated,
            mentions,
            reactions,
        })
    }

    async fn discover_active_channels(
        &self,
        user_id: &str,
        range: TimeRange,
    ) -> Result<(Vec<String>, HashSet<(String, String)>)> {
        let query = format!("from:<@{user_id}>");
        let search = self.http.execute(|| async { self.platform.search_messages(&query, range).await }).await;

        match search {
            Ok(hits) => {
                let mut channel_ids = HashSet::new();
                let mut thread_hints = HashSet::new();
                for hit in &hits {
                    channel_ids.insert(hit.message.channel_id.clone());
                    if let Some(parent) = &hit.thread_parent_ts {
                        thread_hints.insert((hit.message.channel_id.clone(), parent.clone()));
                    }
                }
                Ok((channel_ids.into_iter().collect(), thread_hints))
            }
            Err(err) => {
                warn!(error = %err, "active-channel search failed, falling back to member channels");
                let channels = self
                    .http
                    .execute(|| async { self.platform.member_channels(user_id).await })
                    .await?;
                Ok((channels.into_iter().map(|c| c.id).collect(), HashSet::new()))
            }
        }
    }

    async fn fetch_channel_info(&self, channel_id: &str) -> Result<Channel> {
        if let Some(cached) = self.cache.get_cached_channel(channel_id).await? {
            return Ok(cached);
        }
        let info = self.http.execute(|| async { self.platform.channel_info(channel_id).await }).await?;
        self.cache.cache_channel(&info).await?;
        Ok(info)
    }

    /// Iterate day buckets intersecting `range`, serving cached days from the
    /// store and fetching uncached ones from the platform (§4.C phase 2).
    async fn fetch_channel_history(&self, channel_id: &str, user_id: &str, range: TimeRange) -> Result<Vec<Message>> {
        let mut all = Vec::new();
        for (day_start, day_end, bucket) in self.day_windows(range) {
            let already_fetched = !self.settings.skip_cache
                && self.cache.is_day_fetched(user_id, channel_id, &bucket, WatermarkKind::Messages).await?;

            if already_fetched {
                let cached = self.cache.get_cached_messages(channel_id, day_start, day_end).await?;
                debug!(channel_id, bucket = %bucket, count = cached.len(), "served channel history from cache");
                all.extend(cached);
                continue;
            }

            let day_range = TimeRange { start: day_start, end: day_end };
            let page = self
                .http
                .execute(|| async { self.platform.channel_history(channel_id, day_range).await })
                .await?;
            self.cache.cache_messages(channel_id, &page).await?;
            self.cache.mark_day_fetched(user_id, channel_id, &bucket, WatermarkKind::Messages).await?;
            all.extend(page);
        }
        all.sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());
        Ok(all)
    }

    async fn fetch_mentions(&self, user_id: &str, range: TimeRange) -> Result<Vec<Message>> {
        let query = format!("<@{user_id}>");
        let mut all = Vec::new();
        for (day_start, day_end, bucket) in self.day_windows(range) {
            let already_fetched = !self.settings.skip_cache
                && self.cache.is_day_fetched(user_id, "mentions", &bucket, WatermarkKind::Mentions).await?;

            if already_fetched {
                all.extend(self.cache.get_cached_mentions(user_id, day_start, day_end).await?);
                continue;
            }

            let day_range = TimeRange { start: day_start, end: day_end };
            let hits = self.http.execute(|| async { self.platform.search_messages(&query, day_range).await }).await?;
            let messages: Vec<Message> = hits.into_iter().map(|h| h.message).collect();
            self.cache.cache_mentions(user_id, &messages).await?;
            self.cache.mark_day_fetched(user_id, "mentions", &bucket, WatermarkKind::Mentions).await?;
            all.extend(messages);
        }
        all.sort_by(|a, b| a.ts_seconds().partial_cmp(&b.ts_seconds()).unwrap());
        Ok(all)
    }

    async fn fetch_reactions(&self, user_id: &str, range: TimeRange) -> Result<Vec<Reaction>> {
        let mut all = Vec::new();
        for (day_start, day_end, bucket) in self.day_windows(range) {
            let already_fetched = !self.settings.skip_cache
                && self.cache.is_day_fetched(user_id, "reactions", &bucket, WatermarkKind::Reactions).await?;

            if already_fetched {
                all.extend(self.cache.get_cached_reactions(user_id, day_start, day_end).await?);
                continue;
            }

            let day_range = TimeRange { start: day_start, end: day_end };
            let page = self.http.execute(|| async { self.platform.reactions_list(user_id, day_range).await }).await?;
            let filtered: Vec<Reaction> = page
                .into_iter()
                .filter(|r| {
                    let t: f64 = r.ts.parse().unwrap_or(0.0);
                    day_range.contains(t)
                })
                .collect();
            self.cache.cache_reactions(user_id, &filtered).await?;
            self.cache.mark_day_fetched(user_id, "reactions", &bucket, WatermarkKind::Reactions).await?;
            all.extend(filtered);
        }
        all.sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap());
        Ok(all)
    }

    /// `(window_start_ts, window_end_ts, day_bucket)` triples for every local
    /// day bucket `range` intersects, each clipped to `range` itself.
    fn day_windows(&self, range: TimeRange) -> Vec<(f64, f64, String)> {
        let mut out = Vec::new();
        let mut cursor = range.start;
        loop {
            let bucket = self.cache.day_bucket(cursor);
            let (_, local_day_end) = self.cache.local_day_bounds(cursor);
            let window_end = local_day_end.min(range.end);
            out.push((cursor, window_end, bucket));
            if window_end >= range.end {
                break;
            }
            cursor = window_end;
        }
        out
    }
}
