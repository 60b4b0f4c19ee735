//! §4.A — Rate-limited HTTP client.
//!
//! A single process-wide token-bucket limiter (`utils::rate_limiter::RateLimiter`,
//! itself a thin wrapper over `governor`) gates every chat-platform RPC.
//! `execute` classifies failures and retries
//! transient/rate-limited ones transparently; fatal errors surface
//! immediately. `clear_queue` is the cooperative cancellation primitive: it
//! flips a flag new callers check before they even acquire a rate-limit
//! token, so in-flight calls finish but nothing new starts.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{classify, DigestError, FailureClass, Result};
use crate::utils::RateLimiter;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub default_retry_after_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            default_retry_after_secs: 60,
        }
    }
}

/// Process-wide rate-limited RPC executor.
pub struct HttpClient {
    limiter: RateLimiter,
    policy: RetryPolicy,
    cancelled: Arc<AtomicBool>,
}

impl HttpClient {
    pub fn new(requests_per_second: u32, policy: RetryPolicy) -> anyhow::Result<Self> {
        // governor's RateLimiter is quota-per-minute; callers configure in RPS.
        let per_minute = (requests_per_second.max(1)) * 60;
        Ok(Self {
            limiter: RateLimiter::new(per_minute)?,
            policy,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Reject all pending and future work until a fresh client is built.
    /// In-flight calls are not interrupted (cooperative cancellation).
    pub fn clear_queue(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run `thunk`, retrying on transient/rate-limited failures per policy.
    /// `classifier` lets callers use a precise error taxonomy for their own
    /// RPC layer; defaults to the heuristic string-matcher in `error::classify`.
    pub async fn execute<F, Fut, T>(&self, thunk: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_classified(thunk, classify).await
    }

    pub async fn execute_classified<F, Fut, T, C>(&self, thunk: F, classifier: C) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        C: Fn(&anyhow::Error) -> FailureClass,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.is_cancelled() {
                return Err(DigestError::Cancelled);
            }
            self.limiter
                .acquire()
                .await
                .map_err(DigestError::Other)?;

            match thunk().await {
                Ok(v) => return Ok(v),
                Err(e) => match classifier(&e) {
                    FailureClass::Fatal => return Err(DigestError::Other(e)),
                    FailureClass::RateLimited => {
                        let retry_after = extract_retry_after(&e)
                            .unwrap_or(self.policy.default_retry_after_secs);
                        warn!(retry_after, "rate limited, waiting");
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        // Does not count against max_retries.
                        continue;
                    }
                    FailureClass::Transient => {
                        attempt += 1;
                        if attempt > self.policy.max_retries {
                            return Err(DigestError::Transient {
                                attempts: attempt,
                                source: e,
                            });
                        }
                        let backoff =
                            self.policy.initial_backoff_ms * 2u64.saturating_pow(attempt - 1);
                        debug!(attempt, backoff, "transient error, retrying");
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }
                },
            }
        }
    }
}

/// Best-effort `retry-after` extraction from an error message of the form
/// `"...retry-after=NN..."`. Real chat-platform errors should carry this as
/// structured data; this is the string fallback used by the default classifier.
fn extract_retry_after(err: &anyhow::Error) -> Option<u64> {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    let idx = lower.find("retry-after")?;
    let rest = &lower[idx..];
    rest.chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let client = HttpClient::new(1000, RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 1,
            default_retry_after_secs: 0,
        })
        .unwrap();

        let calls = AtomicU32::new(0);
        let result = client
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(anyhow::anyhow!("ETIMEDOUT"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_surface_immediately() {
        let client = HttpClient::new(1000, RetryPolicy::default()).unwrap();
        let calls = AtomicU32::new(0);
        let result: Result<()> = client
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("auth failed: invalid token"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_transient_retries_surface_transient_error() {
        let client = HttpClient::new(1000, RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            default_retry_after_secs: 0,
        })
        .unwrap();

        let result: Result<()> = client
            .execute(|| async { Err(anyhow::anyhow!("ECONNRESET")) })
            .await;

        assert!(matches!(result, Err(DigestError::Transient { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn clear_queue_rejects_new_work() {
        let client = HttpClient::new(1000, RetryPolicy::default()).unwrap();
        client.clear_queue();
        let result: Result<()> = client.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(DigestError::Cancelled)));
    }
}
