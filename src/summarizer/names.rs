//! §4.H step 1 — participant display-name resolution with promise
//! de-duplication (§9 "Promise de-duplication"): a mutex-guarded
//! `map<user_id, shared future>` so concurrent summarizer tasks asking for
//! the same id share one in-flight RPC instead of issuing N.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::http_client::HttpClient;
use crate::platform::ChatPlatformClient;

type SharedNameFuture = Shared<BoxFuture<'static, String>>;

pub struct DisplayNameResolver {
    platform: Arc<dyn ChatPlatformClient>,
    http: Arc<HttpClient>,
    resolved: Mutex<HashMap<String, String>>,
    in_flight: Mutex<HashMap<String, SharedNameFuture>>,
}

impl DisplayNameResolver {
    pub fn new(platform: Arc<dyn ChatPlatformClient>, http: Arc<HttpClient>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            http,
            resolved: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Seed the resolved cache in bulk (the aggregator's workspace-wide
    /// `users.list` call, §4.J step 3) so most lookups never need an RPC.
    pub fn seed(&self, names: impl IntoIterator<Item = (String, String)>) {
        let mut resolved = self.resolved.lock();
        for (id, name) in names {
            resolved.entry(id).or_insert(name);
        }
    }

    /// Resolve a single user id to a display name, sharing in-flight fetches
    /// across concurrent callers. On fetch failure, falls back to the bare
    /// id and does *not* poison the resolved cache (§4.H: a later call may
    /// succeed).
    pub async fn resolve(self: &Arc<Self>, user_id: &str) -> String {
        if let Some(name) = self.resolved.lock().get(user_id).cloned() {
            return name;
        }

        let fut = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(user_id) {
                existing.clone()
            } else {
                let resolver = self.clone();
                let uid = user_id.to_string();
                let shared: SharedNameFuture =
                    async move { resolver.fetch(&uid).await }.boxed().shared();
                in_flight.insert(user_id.to_string(), shared.clone());
                shared
            }
        };

        let name = fut.await;
        self.in_flight.lock().remove(user_id);
        name
    }

    async fn fetch(&self, user_id: &str) -> String {
        match self.http.execute(|| async { self.platform.user_display_name(user_id).await }).await {
            Ok(name) => {
                self.resolved.lock().insert(user_id.to_string(), name.clone());
                name
            }
            Err(_) => user_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::RetryPolicy;
    use crate::platform::fake::FakeChatPlatformClient;

    #[tokio::test]
    async fn seeded_name_requires_no_rpc() {
        let mut fake = FakeChatPlatformClient::new("U0");
        fake.display_names.insert("U1".to_string(), "Alice".to_string());
        let http = Arc::new(HttpClient::new(1000, RetryPolicy::default()).unwrap());
        let resolver = DisplayNameResolver::new(Arc::new(fake), http);
        resolver.seed([("U1".to_string(), "Alice".to_string())]);
        assert_eq!(resolver.resolve("U1").await, "Alice");
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_fetch() {
        let mut fake = FakeChatPlatformClient::new("U0");
        fake.display_names.insert("U1".to_string(), "Bob".to_string());
        let http = Arc::new(HttpClient::new(1000, RetryPolicy::default()).unwrap());
        let resolver = DisplayNameResolver::new(Arc::new(fake), http);

        let (a, b) = tokio::join!(resolver.resolve("U1"), resolver.resolve("U1"));
        assert_eq!(a, "Bob");
        assert_eq!(b, "Bob");
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_bare_id() {
        let fake = FakeChatPlatformClient::new("U0");
        let http = Arc::new(HttpClient::new(1000, RetryPolicy { max_retries: 0, initial_backoff_ms: 1, default_retry_after_secs: 0 }).unwrap());
        let resolver = DisplayNameResolver::new(Arc::new(fake), http);
        assert_eq!(resolver.resolve("U999").await, "U999");
    }
}
