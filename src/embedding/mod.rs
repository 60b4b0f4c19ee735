//! §4.F — Embedding client and hybrid similarity.
//!
//! Conversation text is embedded and cached by `(conversation_id, text_hash)`
//! so a conversation whose text hasn't changed since the last run never
//! re-hits the provider. `hybrid_similarity` is the scoring function the
//! consolidator's union-find pass drives off of.

pub mod http_provider;

use std::collections::{HashMap, HashSet};

use crate::cache::{CachedEmbedding, EmbeddingCache};
use crate::error::Result;
use crate::model::Conversation;
use crate::utils::sha256_hash;

pub use http_provider::HttpEmbeddingProvider;

/// Anything that can turn a batch of texts into embedding vectors. A real
/// implementation wraps a provider's HTTP API; tests use a deterministic
/// fake.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// One vector per input text, same order. A provider-level failure
    /// should return `Err` for the whole batch — callers treat that as "no
    /// embeddings this batch" rather than retrying item by item.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Conversation text per §4.F: space-joined non-empty message texts in ts
/// order. Conversation messages are already ts-sorted (§3 invariant).
pub fn conversation_text(conv: &Conversation) -> String {
    conv.joined_text()
}

pub fn text_hash(text: &str) -> String {
    sha256_hash(text)
}

/// The per-run result of [`prepare_conversation_embeddings`]: conversation
/// id to embedding, or `None` when the text was empty or the provider
/// couldn't supply one.
pub struct EmbeddingLookup {
    by_conversation: HashMap<String, Vec<f32>>,
}

impl EmbeddingLookup {
    pub fn empty() -> Self {
        Self { by_conversation: HashMap::new() }
    }

    pub fn get(&self, conversation_id: &str) -> Option<&[f32]> {
        self.by_conversation.get(conversation_id).map(|v| v.as_slice())
    }
}

/// §4.F batch path. Never returns `Err`: a provider failure leaves the
/// affected conversations with no embedding rather than aborting the run
/// (§7: "per-conversation null embedding; hybrid score degrades to
/// reference-only").
pub async fn prepare_conversation_embeddings(
    conversations: &[Conversation],
    cache: &EmbeddingCache<'_>,
    provider: &dyn EmbeddingProvider,
) -> EmbeddingLookup {
    let mut keyed: Vec<(String, String, String)> = Vec::with_capacity(conversations.len()); // (conv_id, text, hash)
    for conv in conversations {
        let text = conversation_text(conv);
        let hash = text_hash(&text);
        keyed.push((conv.id.clone(), text, hash));
    }

    let lookup_keys: Vec<(String, String)> = keyed.iter().map(|(id, _, h)| (id.clone(), h.clone())).collect();
    let cached = match cache.get_batch(&lookup_keys).await {
        Ok(map) => map,
        Err(err) => {
            tracing::warn!(error = %err, "embedding cache lookup failed; treating all as misses");
            HashMap::new()
        }
    };

    let mut by_conversation: HashMap<String, Vec<f32>> = HashMap::new();
    let mut miss_ids = Vec::new();
    let mut miss_texts = Vec::new();

    for (id, text, hash) in &keyed {
        if text.trim().is_empty() {
            continue;
        }
        if let Some(entry) = cached.get(id) {
            by_conversation.insert(id.clone(), entry.embedding.clone());
            continue;
        }
        miss_ids.push((id.clone(), hash.clone()));
        miss_texts.push(text.clone());
    }

    if !miss_texts.is_empty() {
        match provider.embed_batch(&miss_texts).await {
            Ok(vectors) if vectors.len() == miss_ids.len() => {
                let mut to_store = Vec::with_capacity(vectors.len());
                for ((id, hash), vector) in miss_ids.iter().zip(vectors.into_iter()) {
                    to_store.push(CachedEmbedding {
                        conversation_id: id.clone(),
                        dimensions: vector.len(),
                        embedding: vector.clone(),
                        text_hash: hash.clone(),
                        model: provider.model_name().to_string(),
                    });
                    by_conversation.insert(id.clone(), vector);
                }
                if let Err(err) = cache.set_batch(&to_store).await {
                    tracing::warn!(error = %err, "failed to persist new embeddings to cache");
                }
            }
            Ok(mismatched) => {
                tracing::warn!(
                    expected = miss_ids.len(),
                    got = mismatched.len(),
                    "embedding provider returned a mismatched batch size; leaving those conversations unembedded"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "embedding provider call failed; leaving this batch unembedded");
            }
        }
    }

    EmbeddingLookup { by_conversation }
}

/// Cosine similarity. Both vectors must have equal length. Zero-magnitude
/// vectors yield `0.0` rather than `NaN`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(crate::error::DigestError::Embedding(format!(
            "dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}

/// §4.F hybrid score: reference-only when embeddings are absent (or the
/// provider never populated them), reference + embedding otherwise.
pub fn hybrid_similarity(
    refs_a: &HashSet<String>,
    refs_b: &HashSet<String>,
    emb_a: Option<&[f32]>,
    emb_b: Option<&[f32]>,
) -> f64 {
    hybrid_similarity_weighted(refs_a, refs_b, emb_a, emb_b, 0.5, 0.5)
}

pub fn hybrid_similarity_weighted(
    refs_a: &HashSet<String>,
    refs_b: &HashSet<String>,
    emb_a: Option<&[f32]>,
    emb_b: Option<&[f32]>,
    w_ref: f64,
    w_emb: f64,
) -> f64 {
    let ref_sim = crate::references::jaccard(refs_a, refs_b);
    match (emb_a, emb_b) {
        (Some(a), Some(b)) => match cosine_similarity(a, b) {
            Ok(cos) => w_ref * ref_sim + w_emb * cos.max(0.0),
            Err(_) => ref_sim,
        },
        _ => ref_sim,
    }
}
