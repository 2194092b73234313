//! In-memory origin for running the worker without a network.
//!
//! Routes are keyed by absolute URL (fragment stripped). Unknown URLs answer
//! 404, URLs marked with [`StubFetcher::fail`] and every URL while the stub
//! is offline produce a transport error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::StatusCode;
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
struct StubRoute {
    status: StatusCode,
    body: Bytes,
}

/// Scriptable [`Fetcher`] backed by a route table.
#[derive(Debug)]
pub struct StubFetcher {
    origin: Url,
    routes: RwLock<HashMap<String, StubRoute>>,
    failing: RwLock<HashSet<String>>,
    calls: RwLock<HashMap<String, usize>>,
    latency: RwLock<Duration>,
    offline: AtomicBool,
}

impl StubFetcher {
    /// Create a stub serving `origin` (e.g. `http://localhost:3000/`).
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            calls: RwLock::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
            offline: AtomicBool::new(false),
        }
    }

    /// The origin relative paths are resolved against.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Resolve a path or absolute URL to the key used by the route table.
    pub fn resolve(&self, path: &str) -> Result<String, NetError> {
        let mut url = self
            .origin
            .join(path)
            .map_err(|e| NetError::InvalidUrl(format!("{path}: {e}")))?;
        url.set_fragment(None);
        Ok(url.to_string())
    }

    /// Serve `body` with `status` at `path`.
    pub async fn route(&self, path: &str, status: StatusCode, body: impl Into<Bytes>) -> Result<(), NetError> {
        let key = self.resolve(path)?;
        self.routes.write().await.insert(
            key,
            StubRoute {
                status,
                body: body.into(),
            },
        );
        Ok(())
    }

    /// Serve `body` with 200 OK at `path`.
    pub async fn ok(&self, path: &str, body: impl Into<Bytes>) -> Result<(), NetError> {
        self.route(path, StatusCode::OK, body).await
    }

    /// Make every fetch of `path` fail at the transport level.
    pub async fn fail(&self, path: &str) -> Result<(), NetError> {
        let key = self.resolve(path)?;
        self.failing.write().await.insert(key);
        Ok(())
    }

    /// Toggle the whole origin offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every response by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    /// Number of fetches issued for `path` so far.
    pub async fn calls(&self, path: &str) -> usize {
        match self.resolve(path) {
            Ok(key) => self.calls.read().await.get(&key).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Total fetches issued across all URLs.
    pub async fn total_calls(&self) -> usize {
        self.calls.read().await.values().sum()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let key = request.cache_key();
        *self.calls.write().await.entry(key.clone()).or_insert(0) += 1;

        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(key));
        }
        if self.failing.read().await.contains(&key) {
            return Err(NetError::RequestFailed(format!("connection reset: {key}")));
        }

        let route = self.routes.read().await.get(&key).cloned();
        trace!(url = %key, found = route.is_some(), "Stub fetch");

        Ok(match route {
            Some(route) => Response::new(request.url, route.status, route.body),
            None => Response::new(request.url, StatusCode::NOT_FOUND, Bytes::from_static(b"Not Found")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub() -> StubFetcher {
        StubFetcher::new(Url::parse("http://localhost:3000/").unwrap())
    }

    #[tokio::test]
    async fn test_routes_and_counts() {
        let stub = stub();
        stub.ok("/app.js", "console.log(1)").await.unwrap();

        let response = stub
            .fetch(Request::parse("http://localhost:3000/app.js").unwrap())
            .await
            .unwrap();
        assert!(response.ok());
        assert_eq!(response.text().unwrap(), "console.log(1)");
        assert_eq!(stub.calls("/app.js").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_is_404() {
        let stub = stub();
        let response = stub
            .fetch(Request::parse("http://localhost:3000/missing").unwrap())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_offline_and_failing() {
        let stub = stub();
        stub.ok("/", "<html>").await.unwrap();
        stub.fail("/broken").await.unwrap();

        let broken = stub
            .fetch(Request::parse("http://localhost:3000/broken").unwrap())
            .await;
        assert!(matches!(broken, Err(NetError::RequestFailed(_))));

        stub.set_offline(true);
        let root = stub
            .fetch(Request::parse("http://localhost:3000/").unwrap())
            .await;
        assert!(matches!(root, Err(NetError::Offline(_))));
        assert_eq!(stub.total_calls().await, 2);
    }
}
