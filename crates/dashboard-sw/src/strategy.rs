//! Fetch/cache strategies.
//!
//! Every strategy returns a response: when both the network and the target
//! partition are exhausted the caller gets [`offline_response`]. Only 2xx
//! responses to `GET` requests are ever stored, and only `GET` requests are
//! ever answered from a partition.

use std::sync::Arc;

use dashboard_net::{Fetcher, Request, Response};
use http::{Method, StatusCode};
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheError, CacheStorage};
use crate::config::StrategyKind;
use crate::{Result, ServiceWorkerError};

/// Body of the synthetic response served when nothing else is available.
pub const OFFLINE_MESSAGE: &str = "Service unavailable offline. Please check your connection and try again.";

/// Synthetic 503 returned when both network and cache are exhausted.
pub fn offline_response(url: Url) -> Response {
    Response::synthetic(url, StatusCode::SERVICE_UNAVAILABLE, OFFLINE_MESSAGE)
}

/// Runs strategies against a fetcher and the shared cache storage.
#[derive(Clone)]
pub struct StrategyExecutor {
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    revalidations: TaskTracker,
}

impl StrategyExecutor {
    pub fn new(fetcher: Arc<dyn Fetcher>, caches: CacheStorage) -> Self {
        Self {
            fetcher,
            caches,
            revalidations: TaskTracker::new(),
        }
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Serve `request` from `partition` using `strategy`. Non-GET requests
    /// skip the partition entirely.
    pub async fn execute(&self, request: Request, partition: &str, strategy: StrategyKind) -> Response {
        if request.method != Method::GET {
            debug!(url = %request.url, method = %request.method, "Bypassing cache for non-GET request");
            return self.passthrough(request).await;
        }
        trace!(url = %request.url, partition, %strategy, "Executing strategy");
        match strategy {
            StrategyKind::CacheFirst => self.cache_first(request, partition).await,
            StrategyKind::NetworkFirst => self.network_first(request, partition).await,
            StrategyKind::StaleWhileRevalidate => self.stale_while_revalidate(request, partition).await,
        }
    }

    /// Cached entry if present, otherwise the network (stored on success).
    pub async fn cache_first(&self, request: Request, partition: &str) -> Response {
        if let Some(entry) = self.caches.match_in(partition, &request.cache_key()).await {
            debug!(url = %request.url, partition, "Cache hit");
            return entry.to_response();
        }

        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                store(&self.caches, partition, &request, &response).await;
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network failed with no cached copy");
                offline_response(request.url)
            }
        }
    }

    /// Network response if reachable (stored on success), otherwise the
    /// cached entry.
    pub async fn network_first(&self, request: Request, partition: &str) -> Response {
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                store(&self.caches, partition, &request, &response).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match self.caches.match_in(partition, &request.cache_key()).await {
                    Some(entry) => entry.to_response(),
                    None => {
                        warn!(url = %request.url, partition, "No cached fallback");
                        offline_response(request.url)
                    }
                }
            }
        }
    }

    /// Cached entry immediately with a background refresh; without a cached
    /// entry the caller waits for the network.
    pub async fn stale_while_revalidate(&self, request: Request, partition: &str) -> Response {
        let Some(entry) = self.caches.match_in(partition, &request.cache_key()).await else {
            return match self.fetcher.fetch(request.clone()).await {
                Ok(response) => {
                    store(&self.caches, partition, &request, &response).await;
                    response
                }
                Err(e) => {
                    warn!(url = %request.url, error = %e, "Network failed with no cached copy");
                    offline_response(request.url)
                }
            };
        };

        let fetcher = Arc::clone(&self.fetcher);
        let caches = self.caches.clone();
        let partition = partition.to_string();
        let background = request.clone();
        self.revalidations.spawn(async move {
            match fetcher.fetch(background.clone()).await {
                Ok(response) => store(&caches, &partition, &background, &response).await,
                Err(e) => debug!(url = %background.url, error = %e, "Revalidation failed"),
            }
        });

        debug!(url = %request.url, "Serving stale entry while revalidating");
        entry.to_response()
    }

    /// Fetch `request`, treating transport failures and non-2xx statuses as
    /// errors.
    pub async fn fetch_ok(&self, request: Request) -> Result<Response> {
        let url = request.url.clone();
        let response = self.fetcher.fetch(request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::Network(format!(
                "{url} returned {}",
                response.status
            )));
        }
        Ok(response)
    }

    /// Fetch `request` and store it in `partition`.
    pub async fn fetch_into(&self, partition: &str, request: Request) -> Result<()> {
        let response = self.fetch_ok(request.clone()).await?;
        self.caches.put(partition, &request, &response).await?;
        Ok(())
    }

    /// Fetch straight from the network, bypassing every partition.
    pub async fn passthrough(&self, request: Request) -> Response {
        let url = request.url.clone();
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Passthrough fetch failed");
                offline_response(url)
            }
        }
    }

    /// Wait until every background revalidation started so far has settled.
    pub async fn revalidations_settled(&self) {
        self.revalidations.close();
        self.revalidations.wait().await;
        self.revalidations.reopen();
    }
}

/// Store a network response unless it is not cacheable. Failures are logged
/// and never reach the caller.
async fn store(caches: &CacheStorage, partition: &str, request: &Request, response: &Response) {
    if !response.ok() {
        debug!(url = %request.url, status = %response.status, "Not caching unsuccessful response");
        return;
    }
    match caches.put(partition, request, response).await {
        Ok(()) => trace!(url = %request.url, partition, "Stored response"),
        Err(e @ CacheError::NotCacheable(_)) => debug!(error = %e, "Skipping cache write"),
        Err(e) => warn!(url = %request.url, partition, error = %e, "Cache write failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dashboard_net::StubFetcher;
    use std::time::Duration;

    const PARTITION: &str = "dashboard-api-v1.0.0";

    fn setup() -> (Arc<StubFetcher>, StrategyExecutor) {
        let stub = Arc::new(StubFetcher::new(Url::parse("http://localhost:3000/").unwrap()));
        let executor = StrategyExecutor::new(stub.clone(), CacheStorage::new());
        (stub, executor)
    }

    fn request(stub: &StubFetcher, path: &str) -> Request {
        Request::parse(&stub.resolve(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_cache_first_hits_network_once() {
        let (stub, executor) = setup();
        stub.ok("/app.js", "console.log(1)").await.unwrap();

        let first = executor.cache_first(request(&stub, "/app.js"), PARTITION).await;
        let second = executor.cache_first(request(&stub, "/app.js"), PARTITION).await;

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.body, first.body);
        assert_eq!(stub.calls("/app.js").await, 1);
    }

    #[tokio::test]
    async fn test_error_status_returned_but_not_cached() {
        let (stub, executor) = setup();
        stub.route("/api/flaky", StatusCode::INTERNAL_SERVER_ERROR, "boom")
            .await
            .unwrap();

        let response = executor.network_first(request(&stub, "/api/flaky"), PARTITION).await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(executor.caches().entry_keys(PARTITION).await.is_empty());
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let (stub, executor) = setup();
        stub.ok("/api/projects", "[1,2,3]").await.unwrap();

        let live = executor.network_first(request(&stub, "/api/projects"), PARTITION).await;
        stub.set_offline(true);
        let fallback = executor.network_first(request(&stub, "/api/projects"), PARTITION).await;

        assert!(!live.from_cache);
        assert!(fallback.from_cache);
        assert_eq!(fallback.body, Bytes::from_static(b"[1,2,3]"));
    }

    #[tokio::test]
    async fn test_offline_without_cache_is_503() {
        let (stub, executor) = setup();
        stub.set_offline(true);

        for strategy in [
            StrategyKind::CacheFirst,
            StrategyKind::NetworkFirst,
            StrategyKind::StaleWhileRevalidate,
        ] {
            let response = executor
                .execute(request(&stub, "/api/anything"), PARTITION, strategy)
                .await;
            assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(response.text().unwrap(), OFFLINE_MESSAGE);
        }
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_refreshes_in_background() {
        let (stub, executor) = setup();
        stub.ok("/icons/a.png", "v1").await.unwrap();

        let first = executor
            .stale_while_revalidate(request(&stub, "/icons/a.png"), PARTITION)
            .await;
        assert_eq!(first.body, Bytes::from_static(b"v1"));

        stub.ok("/icons/a.png", "v2").await.unwrap();
        let stale = executor
            .stale_while_revalidate(request(&stub, "/icons/a.png"), PARTITION)
            .await;
        assert!(stale.from_cache);
        assert_eq!(stale.body, Bytes::from_static(b"v1"));

        executor.revalidations_settled().await;
        let fresh = executor
            .stale_while_revalidate(request(&stub, "/icons/a.png"), PARTITION)
            .await;
        assert_eq!(fresh.body, Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_stale_entry_does_not_wait_for_network() {
        let (stub, executor) = setup();
        stub.ok("/icons/b.png", "cached").await.unwrap();
        executor
            .stale_while_revalidate(request(&stub, "/icons/b.png"), PARTITION)
            .await;

        stub.set_latency(Duration::from_secs(10)).await;
        let served = tokio::time::timeout(
            Duration::from_millis(500),
            executor.stale_while_revalidate(request(&stub, "/icons/b.png"), PARTITION),
        )
        .await
        .unwrap();
        assert!(served.from_cache);
    }

    #[tokio::test]
    async fn test_post_never_answered_from_cache() {
        let (stub, executor) = setup();
        stub.ok("/api/tasks", "listing").await.unwrap();

        for strategy in [
            StrategyKind::CacheFirst,
            StrategyKind::NetworkFirst,
            StrategyKind::StaleWhileRevalidate,
        ] {
            executor
                .execute(request(&stub, "/api/tasks"), PARTITION, strategy)
                .await;
            executor.revalidations_settled().await;
            let before = stub.calls("/api/tasks").await;

            let post = Request::post(request(&stub, "/api/tasks").url, Bytes::from_static(b"{}"));
            let response = executor.execute(post, PARTITION, strategy).await;

            assert!(!response.from_cache, "{strategy}");
            assert_eq!(response.body, Bytes::from_static(b"listing"));
            assert_eq!(stub.calls("/api/tasks").await, before + 1, "{strategy}");
        }
    }

    #[tokio::test]
    async fn test_offline_post_gets_503_despite_cached_get() {
        let (stub, executor) = setup();
        stub.ok("/api/tasks", "listing").await.unwrap();

        for strategy in [
            StrategyKind::CacheFirst,
            StrategyKind::NetworkFirst,
            StrategyKind::StaleWhileRevalidate,
        ] {
            stub.set_offline(false);
            executor
                .execute(request(&stub, "/api/tasks"), PARTITION, strategy)
                .await;
            stub.set_offline(true);

            let post = Request::post(request(&stub, "/api/tasks").url, Bytes::from_static(b"{}"));
            let response = executor.execute(post, PARTITION, strategy).await;

            assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE, "{strategy}");
            assert_eq!(response.text().unwrap(), OFFLINE_MESSAGE);
        }
    }

    #[tokio::test]
    async fn test_quota_failure_still_returns_response() {
        let (stub, executor) = setup();
        executor.caches().set_quota(Some(2));
        stub.ok("/api/big", "0123456789").await.unwrap();

        let response = executor.network_first(request(&stub, "/api/big"), PARTITION).await;

        assert!(response.ok());
        assert_eq!(response.body.len(), 10);
        assert!(executor.caches().entry_keys(PARTITION).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_ok_rejects_error_status() {
        let (stub, executor) = setup();
        let result = executor.fetch_into(PARTITION, request(&stub, "/missing")).await;
        assert!(matches!(result, Err(ServiceWorkerError::Network(_))));
        assert!(!executor.caches().has(PARTITION).await);
    }
}
