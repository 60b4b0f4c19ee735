// src/config/helpers.rs
// Named environment-variable overrides (§6): these don't share a common
// prefix, so they're applied as an explicit pass after the figment
// file+defaults layers rather than through `figment::providers::Env`.

use super::{Config, LlmBackendChoice};

pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("SLACK_USER_TOKEN") {
        config.slack.user_token = v;
    }
    if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
        config.anthropic.api_key = Some(v);
    }
    if let Ok(v) = std::env::var("CLAUDE_CODE_OAUTH_TOKEN") {
        config.anthropic.oauth_token = Some(v);
    }
    if let Ok(v) = std::env::var("SHIFTLOG_ANTHROPIC_MODEL") {
        config.anthropic.model = v;
    }
    if let Ok(v) = std::env::var("SHIFTLOG_ANTHROPIC_BACKEND") {
        config.anthropic.backend = match v.to_lowercase().as_str() {
            "sdk" => LlmBackendChoice::Sdk,
            "cli" => LlmBackendChoice::Cli,
            _ => LlmBackendChoice::Auto,
        };
    }
    if let Ok(v) = std::env::var("DATABASE_PATH") {
        config.database.path = v;
    }
    if let Ok(v) = std::env::var("SHIFTLOG_LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Ok(v) = std::env::var("SHIFTLOG_TIMEZONE") {
        config.settings.timezone = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = Config::test_default();
        cfg.slack.user_token = "xoxp-from-file".to_string();

        // SAFETY: single-threaded test, no concurrent env access.
        unsafe {
            std::env::set_var("SLACK_USER_TOKEN", "xoxp-from-env");
        }
        apply_env_overrides(&mut cfg);
        unsafe {
            std::env::remove_var("SLACK_USER_TOKEN");
        }

        assert_eq!(cfg.slack.user_token, "xoxp-from-env");
    }
}
