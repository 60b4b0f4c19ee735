//! §4.I — LLM provider. Backend selection between an OAuth-CLI subprocess
//! and an HTTP SDK call, expressed as a sum type behind a single
//! [`LlmBackend`] capability (§9 "Runtime polymorphism over LLM backend" —
//! grounded on `backend/src/llm/provider/mod.rs`'s trait + multiple backend
//! structs, generalized from this crate's two named backends instead of the
//! teacher's provider zoo).

mod cli_backend;
mod sdk_backend;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{AnthropicConfig, LlmBackendChoice};
use crate::error::{DigestError, Result};

pub use cli_backend::CliBackend;
pub use sdk_backend::SdkBackend;

#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// The single capability every backend satisfies (§9): `create_message`
/// returns the assistant's text content. CLI and SDK backends both
/// normalize down to this narrow surface even though their wire formats
/// differ substantially.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn create_message(&self, model: &str, max_tokens: u32, messages: &[LlmMessage]) -> anyhow::Result<String>;
}

/// Characters a shell could use to inject additional commands via the
/// configured CLI path (§4.I selection algorithm, step 1).
const SHELL_UNSAFE_CHARS: &[char] = &[';', '&', '|', '`', '$', '\\'];

pub fn cli_path_is_shell_safe(cli_path: &str) -> bool {
    !cli_path.chars().any(|c| SHELL_UNSAFE_CHARS.contains(&c))
}

/// Best-effort discoverability check: absolute/relative paths are checked
/// directly; bare names are searched for on `PATH`, the way a shell would
/// resolve them before exec.
pub fn cli_binary_discoverable(cli_path: &str) -> bool {
    let path = std::path::Path::new(cli_path);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(cli_path).is_file())
        })
        .unwrap_or(false)
}

/// §4.I backend selection algorithm.
pub fn select_backend(config: &AnthropicConfig) -> Result<Arc<dyn LlmBackend>> {
    match config.backend {
        LlmBackendChoice::Sdk => {
            let key = require_sdk_key(config)?;
            Ok(Arc::new(SdkBackend::new(key)))
        }
        LlmBackendChoice::Cli => {
            let token = require_oauth_token(config)?;
            Ok(Arc::new(CliBackend::new(config.cli_path.clone(), token)))
        }
        LlmBackendChoice::Auto => {
            if let Some(token) = &config.oauth_token {
                if !token.is_empty()
                    && cli_binary_discoverable(&config.cli_path)
                    && cli_path_is_shell_safe(&config.cli_path)
                {
                    return Ok(Arc::new(CliBackend::new(config.cli_path.clone(), token.clone())));
                }
            }
            if let Some(key) = &config.api_key {
                if !key.is_empty() {
                    return Ok(Arc::new(SdkBackend::new(key.clone())));
                }
            }
            Err(DigestError::Credentials(
                "no usable Anthropic credentials found (run `shiftlog configure` to set up api_key or oauth_token)"
                    .to_string(),
            ))
        }
    }
}

fn require_sdk_key(config: &AnthropicConfig) -> Result<String> {
    match &config.api_key {
        Some(key) if key.starts_with("sk-ant-") => Ok(key.clone()),
        _ => Err(DigestError::Credentials(
            "sdk backend requires [anthropic].api_key starting with 'sk-ant-' (run `shiftlog configure`)".to_string(),
        )),
    }
}

fn require_oauth_token(config: &AnthropicConfig) -> Result<String> {
    match &config.oauth_token {
        Some(token) if token.starts_with("sk-ant-oat") => Ok(token.clone()),
        _ => Err(DigestError::Credentials(
            "cli backend requires [anthropic].oauth_token starting with 'sk-ant-oat' (run `shiftlog configure`)"
                .to_string(),
        )),
    }
}

/// Process-global, memoized provider (§9 "Global singletons"). The first
/// successful call's config wins; `reset()` exists purely for test isolation.
static PROVIDER: Mutex<Option<Arc<dyn LlmBackend>>> = Mutex::new(None);

pub fn provider(config: &AnthropicConfig) -> Result<Arc<dyn LlmBackend>> {
    let mut guard = PROVIDER.lock();
    if let Some(existing) = guard.as_ref() {
        return Ok(existing.clone());
    }
    let backend = select_backend(config)?;
    *guard = Some(backend.clone());
    Ok(backend)
}

pub fn reset() {
    *PROVIDER.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn shell_unsafe_cli_path_rejected() {
        assert!(!cli_path_is_shell_safe("claude; rm -rf /"));
        assert!(cli_path_is_shell_safe("/usr/local/bin/claude"));
    }

    #[test]
    fn sdk_explicit_requires_api_key_prefix() {
        let mut cfg = Config::test_default().anthropic;
        cfg.backend = LlmBackendChoice::Sdk;
        cfg.api_key = Some("not-a-key".to_string());
        assert!(select_backend(&cfg).is_err());
    }

    #[test]
    fn cli_explicit_requires_oauth_prefix() {
        let mut cfg = Config::test_default().anthropic;
        cfg.backend = LlmBackendChoice::Cli;
        cfg.oauth_token = Some("wrong-prefix".to_string());
        assert!(select_backend(&cfg).is_err());
    }

    #[test]
    fn auto_falls_back_to_sdk_when_no_oauth_token() {
        let mut cfg = Config::test_default().anthropic;
        cfg.backend = LlmBackendChoice::Auto;
        cfg.oauth_token = None;
        cfg.api_key = Some("sk-ant-test".to_string());
        let backend = select_backend(&cfg).unwrap();
        let _: Arc<dyn LlmBackend> = backend;
    }

    #[test]
    fn auto_errors_with_no_credentials_at_all() {
        let mut cfg = Config::test_default().anthropic;
        cfg.oauth_token = None;
        cfg.api_key = None;
        let err = select_backend(&cfg).unwrap_err();
        assert!(matches!(err, DigestError::Credentials(_)));
    }
}
