//! Crate-wide error kinds, grouped by §7's behavioral classes rather than
//! by subsystem: callers match on these to decide whether to retry,
//! warn-and-skip, or abort the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("configuration error: {0} (run `shiftlog configure` to fix this)")]
    Config(String),

    #[error("invalid timespan {0:?}: expected a relative token (today, yesterday, last-week), \
             a date (YYYY-MM-DD), or a date range (YYYY-MM-DD..YYYY-MM-DD)")]
    Timespan(String),

    #[error("credentials invalid or missing: {0} (run `shiftlog configure` to set them up)")]
    Credentials(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transient error after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("permanent error on {item}: {source}")]
    Permanent {
        item: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache I/O error: {0}")]
    CacheIo(#[from] sqlx::Error),

    #[error("LLM response could not be parsed: {0}")]
    LlmParse(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("the request was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DigestError>;

/// Classification used by the rate-limited HTTP client (§4.A) to decide how
/// to handle a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    RateLimited,
    Fatal,
}

/// Best-effort classification of an arbitrary error from an RPC call.
///
/// Real chat-platform clients should implement a precise classifier against
/// their own error type; this is the fallback used by the generic retry
/// wrapper in [`crate::http_client`] when callers don't supply one.
pub fn classify(err: &anyhow::Error) -> FailureClass {
    let msg = err.to_string().to_lowercase();
    if msg.contains("ratelimited") || msg.contains("429") || msg.contains("rate limit") {
        return FailureClass::RateLimited;
    }
    if msg.contains("econnreset")
        || msg.contains("etimedout")
        || msg.contains("timeout")
        || msg.contains("connection")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
    {
        return FailureClass::Transient;
    }
    FailureClass::Fatal
}
