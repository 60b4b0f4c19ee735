//! Embedding cache rows: packed little-endian float32 blobs (§4.B
//! "Embedding serialization"). Kept as its own submodule since it's used by
//! [`crate::embedding`] directly rather than through the rest of the
//! store's per-kind get/cache pairs.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CachedEmbedding {
    pub conversation_id: String,
    pub embedding: Vec<f32>,
    pub text_hash: String,
    pub model: String,
    pub dimensions: usize,
}

pub fn pack(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn unpack(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Thin wrapper over the `embeddings` table in [`super::CacheStore`]'s pool.
/// Invariant (§3): a cache hit requires both `conversation_id` and
/// `text_hash` to match — any text change invalidates.
pub struct EmbeddingCache<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EmbeddingCache<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, conversation_id: &str, text_hash: &str) -> Result<Option<CachedEmbedding>> {
        let row = sqlx::query(
            "SELECT embedding, model, dimensions FROM embeddings WHERE conversation_id = ? AND text_hash = ?",
        )
        .bind(conversation_id)
        .bind(text_hash)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("embedding");
            let dimensions: i64 = r.get("dimensions");
            CachedEmbedding {
                conversation_id: conversation_id.to_string(),
                embedding: unpack(&blob),
                text_hash: text_hash.to_string(),
                model: r.get("model"),
                dimensions: dimensions as usize,
            }
        }))
    }

    pub async fn get_batch(&self, keys: &[(String, String)]) -> Result<HashMap<String, CachedEmbedding>> {
        let mut out = HashMap::new();
        for (conv_id, text_hash) in keys {
            if let Some(entry) = self.get(conv_id, text_hash).await? {
                out.insert(conv_id.clone(), entry);
            }
        }
        Ok(out)
    }

    pub async fn set(&self, entry: &CachedEmbedding) -> Result<()> {
        self.set_batch(std::slice::from_ref(entry)).await
    }

    /// Batch writes execute inside a single transaction (§4.B).
    pub async fn set_batch(&self, entries: &[CachedEmbedding]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let blob = pack(&entry.embedding);
            sqlx::query(
                "INSERT INTO embeddings (conversation_id, text_hash, embedding, model, dimensions, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(conversation_id, text_hash) DO UPDATE SET \
                    embedding = excluded.embedding, model = excluded.model, dimensions = excluded.dimensions",
            )
            .bind(&entry.conversation_id)
            .bind(&entry.text_hash)
            .bind(blob)
            .bind(&entry.model)
            .bind(entry.dimensions as i64)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear(&self, conversation_id: Option<&str>) -> Result<u64> {
        let result = match conversation_id {
            Some(id) => {
                sqlx::query("DELETE FROM embeddings WHERE conversation_id = ?")
                    .bind(id)
                    .execute(self.pool)
                    .await?
            }
            None => sqlx::query("DELETE FROM embeddings").execute(self.pool).await?,
        };
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrips_within_tolerance() {
        let vector = vec![0.1_f32, -0.25, 3.0, 0.0, -1.0e-3];
        let packed = pack(&vector);
        assert_eq!(packed.len(), vector.len() * 4);
        let unpacked = unpack(&packed);
        for (a, b) in vector.iter().zip(unpacked.iter()) {
            let tolerance = a.abs() * 1e-6 + 1e-7;
            assert!((a - b).abs() <= tolerance, "{a} vs {b}");
        }
    }

    #[tokio::test]
    async fn cache_hit_requires_both_id_and_hash_match() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(
            "CREATE TABLE embeddings (conversation_id TEXT, text_hash TEXT, embedding BLOB, model TEXT, dimensions INTEGER, created_at TEXT, PRIMARY KEY (conversation_id, text_hash));",
        )
        .execute(&pool)
        .await
        .unwrap();

        let cache = EmbeddingCache::new(&pool);
        cache
            .set(&CachedEmbedding {
                conversation_id: "c1".into(),
                embedding: vec![1.0, 2.0],
                text_hash: "hash-a".into(),
                model: "test-model".into(),
                dimensions: 2,
            })
            .await
            .unwrap();

        assert!(cache.get("c1", "hash-a").await.unwrap().is_some());
        assert!(cache.get("c1", "hash-b").await.unwrap().is_none(), "text change must invalidate");
        assert!(cache.get("c2", "hash-a").await.unwrap().is_none());
    }
}
