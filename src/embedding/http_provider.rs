//! HTTP-backed [`EmbeddingProvider`] (§4.F), enabled by `[embeddings]` in
//! config. Same reqwest-call shape as [`crate::llm::SdkBackend`] — a plain
//! JSON POST, batch in, batch of vectors out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingProvider;

const DEFAULT_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

pub struct HttpEmbeddingProvider {
    api_key: String,
    model: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_EMBEDDINGS_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingsRequest { model: &self.model, input: texts };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("embedding provider error {status}: {text}");
        }

        let parsed: EmbeddingsResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            anyhow::bail!("embedding provider returned {} vectors for {} inputs", parsed.data.len(), texts.len());
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
