//! The OAuth-CLI subprocess backend (§4.I "CLI backend"). Spawns the
//! configured binary per call, isolated in a fresh temp working directory
//! with ambient credentials scrubbed (§9 "Subprocess isolation").

use async_trait::async_trait;
use tokio::process::Command;

use super::{LlmBackend, LlmMessage};

pub struct CliBackend {
    cli_path: String,
    oauth_token: String,
}

impl CliBackend {
    pub fn new(cli_path: String, oauth_token: String) -> Self {
        Self { cli_path, oauth_token }
    }
}

#[async_trait]
impl LlmBackend for CliBackend {
    async fn create_message(&self, model: &str, _max_tokens: u32, messages: &[LlmMessage]) -> anyhow::Result<String> {
        let prompt = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n\n");
        let workdir = tempfile::tempdir()?;

        let output = Command::new(&self.cli_path)
            .arg("-p")
            .arg(&prompt)
            .arg("--model")
            .arg(model)
            .arg("--output-format")
            .arg("json")
            .arg("--no-session-persistence")
            .current_dir(workdir.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("CLAUDE_CODE_OAUTH_TOKEN", &self.oauth_token)
            .env("ANTHROPIC_API_KEY", "")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("claude CLI exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            anyhow::bail!("claude CLI produced no output");
        }

        Ok(parse_cli_output(&stdout))
    }
}

/// Parse the CLI's `--output-format json` stdout, returning the first of
/// `result`/`text`/`response`; non-string values are re-stringified as JSON;
/// invalid JSON falls back to the raw stdout (§4.I).
fn parse_cli_output(stdout: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout.trim()) else {
        return stdout.trim().to_string();
    };

    for key in ["result", "text", "response"] {
        if let Some(field) = value.get(key) {
            return match field {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
        }
    }
    stdout.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_field() {
        let out = parse_cli_output(r#"{"result": "hello there"}"#);
        assert_eq!(out, "hello there");
    }

    #[test]
    fn falls_back_through_text_then_response() {
        assert_eq!(parse_cli_output(r#"{"text": "via text"}"#), "via text");
        assert_eq!(parse_cli_output(r#"{"response": "via response"}"#), "via response");
    }

    #[test]
    fn non_string_field_is_json_stringified() {
        let out = parse_cli_output(r#"{"result": {"nested": true}}"#);
        assert_eq!(out, r#"{"nested":true}"#);
    }

    #[test]
    fn invalid_json_falls_back_to_raw_stdout() {
        assert_eq!(parse_cli_output("not json at all"), "not json at all");
    }
}
