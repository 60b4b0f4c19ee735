//! §4.B — SQLite-backed cache store. Opened in WAL mode with foreign keys;
//! the core treats this as a black box via the operations below. Same
//! `sqlx` query/bind/`row.get` upsert-by-key idiom used elsewhere in this
//! crate, generalized from a single response cache to the five kinds of
//! raw activity this crate fetches.

pub mod embeddings;

use std::path::Path;

use chrono::TimeZone;
use chrono_tz::Tz;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::Result;
use crate::platform::{Channel, ChannelKind, Message, Reaction};

pub use embeddings::{CachedEmbedding, EmbeddingCache};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    channel_id TEXT NOT NULL,
    ts TEXT NOT NULL,
    user_id TEXT,
    text TEXT,
    msg_type TEXT NOT NULL DEFAULT 'message',
    subtype TEXT,
    thread_parent_ts TEXT,
    attachments_json TEXT NOT NULL DEFAULT '[]',
    day_bucket TEXT NOT NULL,
    PRIMARY KEY (channel_id, ts)
);
CREATE INDEX IF NOT EXISTS idx_messages_channel_day ON messages (channel_id, day_bucket);

CREATE TABLE IF NOT EXISTS mentions (
    user_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    ts TEXT NOT NULL,
    author_id TEXT,
    text TEXT,
    thread_parent_ts TEXT,
    day_bucket TEXT NOT NULL,
    PRIMARY KEY (user_id, channel_id, ts)
);
CREATE INDEX IF NOT EXISTS idx_mentions_user_day ON mentions (user_id, day_bucket);

CREATE TABLE IF NOT EXISTS reactions (
    user_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    ts TEXT NOT NULL,
    name TEXT NOT NULL,
    day_bucket TEXT NOT NULL,
    PRIMARY KEY (user_id, channel_id, ts, name)
);
CREATE INDEX IF NOT EXISTS idx_reactions_user_day ON reactions (user_id, day_bucket);

CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    name TEXT,
    kind TEXT NOT NULL,
    members_json TEXT,
    peer_user TEXT,
    cached_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fetch_watermarks (
    user_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    day_bucket TEXT NOT NULL,
    kind TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (user_id, tag, day_bucket, kind)
);

CREATE TABLE IF NOT EXISTS embeddings (
    conversation_id TEXT NOT NULL,
    text_hash TEXT NOT NULL,
    embedding BLOB NOT NULL,
    model TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (conversation_id, text_hash)
);
"#;

/// Fetch-watermark kinds, one per fetcher phase that caches by day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Messages,
    Mentions,
    Reactions,
}

impl WatermarkKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Mentions => "mentions",
            Self::Reactions => "reactions",
        }
    }
}

/// SQLite-backed cache store. `:memory:` is a sentinel meaning "always open
/// a fresh, unshared in-memory database" (§4.B) — since every call to
/// [`CacheStore::open`] constructs a brand new pool, passing `:memory:`
/// naturally satisfies that without any singleton bookkeeping.
pub struct CacheStore {
    pool: SqlitePool,
    timezone: Tz,
}

impl CacheStore {
    pub async fn open(path: &Path, timezone: Tz) -> Result<Self> {
        let pool = if path.as_os_str() == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| anyhow::anyhow!(e))?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!(path = %path.display(), "cache store opened");
        Ok(Self { pool, timezone })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `YYYY-MM-DD` in the store's configured timezone.
    pub fn day_bucket(&self, ts_seconds: f64) -> String {
        let utc = chrono::DateTime::from_timestamp(ts_seconds as i64, 0).unwrap_or_default();
        self.timezone.from_utc_datetime(&utc.naive_utc()).format("%Y-%m-%d").to_string()
    }

    /// The `[start, end)` ts bounds of the local (configured-timezone) day
    /// containing `ts_seconds`, as epoch seconds. Used by callers (the
    /// fetcher's per-day pagination) that need day windows aligned with
    /// [`Self::day_bucket`] rather than UTC midnight.
    pub fn local_day_bounds(&self, ts_seconds: f64) -> (f64, f64) {
        let utc = chrono::DateTime::from_timestamp(ts_seconds as i64, 0).unwrap_or_default();
        let local = self.timezone.from_utc_datetime(&utc.naive_utc());
        let day_start_naive = local.date_naive().and_hms_opt(0, 0, 0).unwrap();
        let day_start = self
            .timezone
            .from_local_datetime(&day_start_naive)
            .single()
            .unwrap_or(local)
            .timestamp() as f64;
        (day_start, day_start + 86400.0)
    }

    /// All day buckets a `[start, end]` ts range intersects, inclusive.
    fn day_buckets_in_range(&self, start: f64, end: f64) -> Vec<String> {
        let mut buckets = Vec::new();
        let start_date = self.timezone.from_utc_datetime(
            &chrono::DateTime::from_timestamp(start as i64, 0).unwrap_or_default().naive_utc(),
        ).date_naive();
        let end_date = self.timezone.from_utc_datetime(
            &chrono::DateTime::from_timestamp(end as i64, 0).unwrap_or_default().naive_utc(),
        ).date_naive();
        let mut cur = start_date;
        while cur <= end_date {
            buckets.push(cur.format("%Y-%m-%d").to_string());
            cur += chrono::Duration::days(1);
        }
        buckets
    }

    // ---- messages ----

    pub async fn get_cached_messages(&self, channel_id: &str, start: f64, end: f64) -> Result<Vec<Message>> {
        let buckets = self.day_buckets_in_range(start, end);
        if buckets.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT channel_id, ts, user_id, text, msg_type, subtype, thread_parent_ts, attachments_json \
             FROM messages WHERE channel_id = ? AND day_bucket IN ({placeholders}) ORDER BY ts ASC"
        );
        let mut query = sqlx::query(&sql).bind(channel_id);
        for b in &buckets {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(row_to_message)
            .filter(|m| {
                let t = m.ts_seconds();
                t >= start && t <= end
            })
            .collect())
    }

    pub async fn cache_messages(&self, channel_id: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for m in messages {
            let attachments_json = serde_json::to_string(&m.attachments).unwrap_or_else(|_| "[]".into());
            let bucket = self.day_bucket(m.ts_seconds());
            sqlx::query(
                "INSERT INTO messages (channel_id, ts, user_id, text, msg_type, subtype, thread_parent_ts, attachments_json, day_bucket) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(channel_id, ts) DO UPDATE SET \
                    user_id = excluded.user_id, text = excluded.text, msg_type = excluded.msg_type, \
                    subtype = excluded.subtype, thread_parent_ts = excluded.thread_parent_ts, \
                    attachments_json = excluded.attachments_json",
            )
            .bind(channel_id)
            .bind(&m.ts)
            .bind(&m.user)
            .bind(&m.text)
            .bind(&m.msg_type)
            .bind(&m.subtype)
            .bind(&m.thread_parent_ts)
            .bind(attachments_json)
            .bind(bucket)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(channel_id, count = messages.len(), "cached messages");
        Ok(())
    }

    // ---- watermarks ----

    pub async fn is_day_fetched(&self, user_id: &str, tag: &str, day_bucket: &str, kind: WatermarkKind) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM fetch_watermarks WHERE user_id = ? AND tag = ? AND day_bucket = ? AND kind = ?",
        )
        .bind(user_id)
        .bind(tag)
        .bind(day_bucket)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn mark_day_fetched(&self, user_id: &str, tag: &str, day_bucket: &str, kind: WatermarkKind) -> Result<()> {
        sqlx::query(
            "INSERT INTO fetch_watermarks (user_id, tag, day_bucket, kind, fetched_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, tag, day_bucket, kind) DO NOTHING",
        )
        .bind(user_id)
        .bind(tag)
        .bind(day_bucket)
        .bind(kind.as_str())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- mentions ----

    pub async fn get_cached_mentions(&self, user_id: &str, start: f64, end: f64) -> Result<Vec<Message>> {
        let buckets = self.day_buckets_in_range(start, end);
        if buckets.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT channel_id, ts, author_id, text, thread_parent_ts FROM mentions \
             WHERE user_id = ? AND day_bucket IN ({placeholders}) ORDER BY ts ASC"
        );
        let mut query = sqlx::query(&sql).bind(user_id);
        for b in &buckets {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| Message {
                channel_id: row.get("channel_id"),
                ts: row.get("ts"),
                user: row.get("author_id"),
                text: row.get("text"),
                msg_type: "message".to_string(),
                subtype: None,
                thread_parent_ts: row.get("thread_parent_ts"),
                attachments: Vec::new(),
            })
            .filter(|m| {
                let t = m.ts_seconds();
                t >= start && t <= end
            })
            .collect())
    }

    pub async fn cache_mentions(&self, user_id: &str, mentions: &[Message]) -> Result<()> {
        if mentions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for m in mentions {
            let bucket = self.day_bucket(m.ts_seconds());
            sqlx::query(
                "INSERT INTO mentions (user_id, channel_id, ts, author_id, text, thread_parent_ts, day_bucket) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT(user_id, channel_id, ts) DO UPDATE SET \
                    author_id = excluded.author_id, text = excluded.text, thread_parent_ts = excluded.thread_parent_ts",
            )
            .bind(user_id)
            .bind(&m.channel_id)
            .bind(&m.ts)
            .bind(&m.user)
            .bind(&m.text)
            .bind(&m.thread_parent_ts)
            .bind(bucket)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- reactions ----

    pub async fn get_cached_reactions(&self, user_id: &str, start: f64, end: f64) -> Result<Vec<Reaction>> {
        let buckets = self.day_buckets_in_range(start, end);
        if buckets.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT channel_id, ts, name FROM reactions WHERE user_id = ? AND day_bucket IN ({placeholders}) ORDER BY ts ASC"
        );
        let mut query = sqlx::query(&sql).bind(user_id);
        for b in &buckets {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| Reaction {
                channel_id: row.get("channel_id"),
                ts: row.get("ts"),
                name: row.get("name"),
                user: user_id.to_string(),
            })
            .filter(|r| {
                let t: f64 = r.ts.parse().unwrap_or(0.0);
                t >= start && t <= end
            })
            .collect())
    }

    pub async fn cache_reactions(&self, user_id: &str, reactions: &[Reaction]) -> Result<()> {
        if reactions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in reactions {
            let t: f64 = r.ts.parse().unwrap_or(0.0);
            let bucket = self.day_bucket(t);
            sqlx::query(
                "INSERT INTO reactions (user_id, channel_id, ts, name, day_bucket) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(user_id, channel_id, ts, name) DO NOTHING",
            )
            .bind(user_id)
            .bind(&r.channel_id)
            .bind(&r.ts)
            .bind(&r.name)
            .bind(bucket)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- channels ----

    pub async fn get_cached_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT id, name, kind, members_json, peer_user FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_channel))
    }

    pub async fn cache_channel(&self, channel: &Channel) -> Result<()> {
        let kind_str = match channel.kind {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
            ChannelKind::Dm => "dm",
            ChannelKind::GroupDm => "group_dm",
        };
        let members_json = channel.members.as_ref().map(|m| serde_json::to_string(m).unwrap_or_default());
        sqlx::query(
            "INSERT INTO channels (id, name, kind, members_json, peer_user, cached_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, kind = excluded.kind, \
                members_json = excluded.members_json, peer_user = excluded.peer_user, cached_at = excluded.cached_at",
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(kind_str)
        .bind(members_json)
        .bind(&channel.peer_user)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- stats ----

    /// Row count and ts range per cached table, for `cache --stats` (§6).
    pub async fn stats(&self) -> Result<CacheStats> {
        async fn table_stat(pool: &SqlitePool, table: &str) -> Result<TableStat> {
            let row = sqlx::query(&format!(
                "SELECT COUNT(*) AS n, MIN(CAST(ts AS REAL)) AS min_ts, MAX(CAST(ts AS REAL)) AS max_ts FROM {table}"
            ))
            .fetch_one(pool)
            .await?;
            Ok(TableStat {
                rows: row.get::<i64, _>("n") as u64,
                earliest_ts: row.try_get::<f64, _>("min_ts").ok(),
                latest_ts: row.try_get::<f64, _>("max_ts").ok(),
            })
        }

        let messages = table_stat(&self.pool, "messages").await?;
        let mentions = table_stat(&self.pool, "mentions").await?;
        let reactions = table_stat(&self.pool, "reactions").await?;
        let channels_row = sqlx::query("SELECT COUNT(*) AS n FROM channels").fetch_one(&self.pool).await?;
        let embeddings_row = sqlx::query("SELECT COUNT(*) AS n FROM embeddings").fetch_one(&self.pool).await?;
        let watermarks_row = sqlx::query("SELECT COUNT(*) AS n FROM fetch_watermarks").fetch_one(&self.pool).await?;

        Ok(CacheStats {
            messages,
            mentions,
            reactions,
            channels: channels_row.get::<i64, _>("n") as u64,
            embeddings: embeddings_row.get::<i64, _>("n") as u64,
            fetch_watermarks: watermarks_row.get::<i64, _>("n") as u64,
        })
    }
}

/// Row count plus ts span for a single time-bucketed table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStat {
    pub rows: u64,
    pub earliest_ts: Option<f64>,
    pub latest_ts: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub messages: TableStat,
    pub mentions: TableStat,
    pub reactions: TableStat,
    pub channels: u64,
    pub embeddings: u64,
    pub fetch_watermarks: u64,
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Message {
    let attachments_json: String = row.get("attachments_json");
    Message {
        channel_id: row.get("channel_id"),
        ts: row.get("ts"),
        user: row.get("user_id"),
        text: row.get("text"),
        msg_type: row.get("msg_type"),
        subtype: row.get("subtype"),
        thread_parent_ts: row.get("thread_parent_ts"),
        attachments: serde_json::from_str(&attachments_json).unwrap_or_default(),
    }
}

fn row_to_channel(row: sqlx::sqlite::SqliteRow) -> Channel {
    let kind_str: String = row.get("kind");
    let kind = match kind_str.as_str() {
        "private" => ChannelKind::Private,
        "dm" => ChannelKind::Dm,
        "group_dm" => ChannelKind::GroupDm,
        _ => ChannelKind::Public,
    };
    let members_json: Option<String> = row.get("members_json");
    Channel {
        id: row.get("id"),
        name: row.get("name"),
        kind,
        members: members_json.and_then(|j| serde_json::from_str(&j).ok()),
        peer_user: row.get("peer_user"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn test_store() -> CacheStore {
        CacheStore::open(&PathBuf::from(":memory:"), chrono_tz::UTC).await.unwrap()
    }

    fn msg(channel: &str, ts: &str) -> Message {
        Message {
            channel_id: channel.to_string(),
            ts: ts.to_string(),
            user: Some("U1".to_string()),
            text: Some("hello".to_string()),
            msg_type: "message".to_string(),
            subtype: None,
            thread_parent_ts: None,
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn cache_and_retrieve_messages_roundtrip() {
        let store = test_store().await;
        store.cache_messages("C1", &[msg("C1", "1700000000.0"), msg("C1", "1700003600.0")]).await.unwrap();
        let got = store.get_cached_messages("C1", 1699999000.0, 1700010000.0).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].ts, "1700000000.0");
    }

    #[tokio::test]
    async fn upsert_overwrites_same_primary_key() {
        let store = test_store().await;
        store.cache_messages("C1", &[msg("C1", "1.0")]).await.unwrap();
        let mut updated = msg("C1", "1.0");
        updated.text = Some("edited".to_string());
        store.cache_messages("C1", &[updated]).await.unwrap();
        let got = store.get_cached_messages("C1", 0.0, 10.0).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn watermarks_guard_refetch() {
        let store = test_store().await;
        assert!(!store.is_day_fetched("U1", "C1", "2026-01-01", WatermarkKind::Messages).await.unwrap());
        store.mark_day_fetched("U1", "C1", "2026-01-01", WatermarkKind::Messages).await.unwrap();
        assert!(store.is_day_fetched("U1", "C1", "2026-01-01", WatermarkKind::Messages).await.unwrap());
    }

    #[tokio::test]
    async fn stats_reports_row_counts_and_ts_span() {
        let store = test_store().await;
        store.cache_messages("C1", &[msg("C1", "100.0"), msg("C1", "200.0")]).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.messages.rows, 2);
        assert_eq!(stats.messages.earliest_ts, Some(100.0));
        assert_eq!(stats.messages.latest_ts, Some(200.0));
        assert_eq!(stats.channels, 0);
    }

    #[tokio::test]
    async fn memory_sentinel_always_fresh() {
        let a = test_store().await;
        a.cache_messages("C1", &[msg("C1", "1.0")]).await.unwrap();
        let b = test_store().await;
        let got = b.get_cached_messages("C1", 0.0, 10.0).await.unwrap();
        assert!(got.is_empty(), "a fresh :memory: store must not see another instance's rows");
    }
}
