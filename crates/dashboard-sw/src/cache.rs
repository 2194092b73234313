//! Cache partitions and the storage that owns them.
//!
//! ```text
//! CacheStorage (shared handle, cloned into every handler)
//!     └── Cache  "<app>-<role>-<version>"
//!             └── request key (URL) → CacheEntry
//! ```
//!
//! No lock is held across a network fetch. Two handlers writing the same key
//! race and the last write wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashboard_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

use crate::now_millis;

/// Errors raised when writing to a partition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Storage quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Request not cacheable: {0}")]
    NotCacheable(String),
}

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Response status.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage.
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the response served to the page.
    pub fn to_response(&self) -> Response {
        Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            from_cache: true,
        }
    }

    /// Stored size in bytes (body only).
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// A single partition.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up a request key.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous one.
    pub fn put(&mut self, key: &str, entry: CacheEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total body bytes held.
    pub fn bytes(&self) -> u64 {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

/// Size summary of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    pub name: String,
    pub entries: usize,
    pub bytes: u64,
}

/// Shared cache storage (the `caches` global). Clones share partitions.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
    /// Byte quota; 0 means unlimited.
    quota: Arc<AtomicU64>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or remove the byte quota.
    pub fn set_quota(&self, quota: Option<u64>) {
        self.quota.store(quota.unwrap_or(0), Ordering::Relaxed);
    }

    fn quota(&self) -> Option<u64> {
        match self.quota.load(Ordering::Relaxed) {
            0 => None,
            quota => Some(quota),
        }
    }

    /// Open a partition, creating it if needed. Returns whether it was created.
    pub async fn open(&self, name: &str) -> bool {
        let mut caches = self.caches.write().await;
        if caches.contains_key(name) {
            return false;
        }
        caches.insert(name.to_string(), Cache::new(name));
        true
    }

    /// Check if a partition exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a partition wholesale.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    /// All partition names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete every partition. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut caches = self.caches.write().await;
        let removed = caches.len();
        caches.clear();
        removed
    }

    /// Store `response` for `request` in partition `name`, creating the
    /// partition on first write.
    pub async fn put(&self, name: &str, request: &Request, response: &Response) -> Result<(), CacheError> {
        if request.method != Method::GET {
            return Err(CacheError::NotCacheable(format!(
                "{} {}",
                request.method, request.url
            )));
        }

        let key = request.cache_key();
        let entry = CacheEntry::from_response(response);
        let mut caches = self.caches.write().await;

        if let Some(quota) = self.quota() {
            let current: u64 = caches.values().map(Cache::bytes).sum();
            let replaced = caches
                .get(name)
                .and_then(|cache| cache.match_request(&key))
                .map(CacheEntry::size)
                .unwrap_or(0);
            let needed = current - replaced + entry.size();
            if needed > quota {
                return Err(CacheError::QuotaExceeded { needed, quota });
            }
        }

        caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(&key, entry);
        Ok(())
    }

    /// Look up `key` in partition `name` only.
    pub async fn match_in(&self, name: &str, key: &str) -> Option<CacheEntry> {
        self.caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    /// Keys stored in partition `name`.
    pub async fn entry_keys(&self, name: &str) -> Vec<String> {
        self.caches
            .read()
            .await
            .get(name)
            .map(Cache::keys)
            .unwrap_or_default()
    }

    /// Size summary of every partition, sorted by name.
    pub async fn summaries(&self) -> Vec<CacheSummary> {
        let caches = self.caches.read().await;
        let mut summaries: Vec<CacheSummary> = caches
            .values()
            .map(|cache| CacheSummary {
                name: cache.name.clone(),
                entries: cache.len(),
                bytes: cache.bytes(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(url: &str, body: &'static str) -> (Request, Response) {
        let request = Request::parse(url).unwrap();
        let response = Response::new(request.url.clone(), StatusCode::OK, body);
        (request, response)
    }

    #[test]
    fn test_cache() {
        let (request, response) = response("https://example.com/style.css", "body{}");
        let mut cache = Cache::new("v1");

        cache.put(&request.cache_key(), CacheEntry::from_response(&response));

        assert!(cache.match_request("https://example.com/style.css").is_some());
        assert!(cache.match_request("https://example.com/other.css").is_none());
        assert_eq!(cache.bytes(), 6);
    }

    #[test]
    fn test_cache_delete() {
        let (request, response) = response("https://example.com/style.css", "");
        let mut cache = Cache::new("v1");

        cache.put(&request.cache_key(), CacheEntry::from_response(&response));
        assert!(cache.delete("https://example.com/style.css"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_roundtrip_marks_from_cache() {
        let (_, response) = response("https://example.com/api/x", "{}");
        let served = CacheEntry::from_response(&response).to_response();
        assert!(served.from_cache);
        assert_eq!(served.body, response.body);
        assert_eq!(served.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = CacheStorage::new();

        assert!(!storage.has("v1").await);
        assert!(storage.open("v1").await);
        assert!(!storage.open("v1").await);
        assert!(storage.has("v1").await);

        assert!(storage.delete("v1").await);
        assert!(!storage.has("v1").await);
    }

    #[tokio::test]
    async fn test_put_creates_partition_lazily() {
        let storage = CacheStorage::new();
        let (request, response) = response("https://example.com/a.png", "png");

        storage.put("dynamic", &request, &response).await.unwrap();

        assert!(storage.has("dynamic").await);
        assert_eq!(
            storage.entry_keys("dynamic").await,
            vec!["https://example.com/a.png".to_string()]
        );
        assert!(storage.match_in("static", &request.cache_key()).await.is_none());
    }

    #[tokio::test]
    async fn test_clones_share_partitions() {
        let storage = CacheStorage::new();
        let other = storage.clone();
        other.open("shared").await;
        assert_eq!(storage.keys().await, vec!["shared".to_string()]);
        assert_eq!(storage.clear().await, 1);
        assert!(other.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_post_not_cacheable() {
        let storage = CacheStorage::new();
        let url = Url::parse("https://example.com/api/items").unwrap();
        let request = Request::post(url.clone(), Bytes::from_static(b"{}"));
        let response = Response::new(url, StatusCode::CREATED, "created");

        let result = storage.put("api", &request, &response).await;
        assert!(matches!(result, Err(CacheError::NotCacheable(_))));
        assert!(!storage.has("api").await);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let storage = CacheStorage::new();
        storage.set_quota(Some(10));

        let (small, small_response) = response("https://example.com/a", "12345");
        let (big, big_response) = response("https://example.com/b", "1234567890");

        storage.put("p", &small, &small_response).await.unwrap();
        let result = storage.put("p", &big, &big_response).await;
        assert_eq!(result, Err(CacheError::QuotaExceeded { needed: 15, quota: 10 }));

        // Replacing an entry only counts the difference.
        storage.put("p", &small, &small_response).await.unwrap();
        assert_eq!(storage.summaries().await[0].bytes, 5);
    }
}
