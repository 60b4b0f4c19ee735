//! The direct HTTP SDK backend (§4.I "SDK backend"): a standard Anthropic
//! Messages API call via `reqwest` (grounded on
//! `backend/src/llm/provider/openai.rs`'s reqwest SDK call shape).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LlmBackend, LlmMessage};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct SdkBackend {
    api_key: String,
    client: reqwest::Client,
}

impl SdkBackend {
    pub fn new(api_key: String) -> Self {
        Self { api_key, client: reqwest::Client::new() }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl LlmBackend for SdkBackend {
    async fn create_message(&self, model: &str, max_tokens: u32, messages: &[LlmMessage]) -> anyhow::Result<String> {
        let body = CreateMessageRequest {
            model,
            max_tokens,
            messages: messages.iter().map(|m| WireMessage { role: &m.role, content: &m.content }).collect(),
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("anthropic api error {status}: {text}");
        }

        let parsed: CreateMessageResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }
}
