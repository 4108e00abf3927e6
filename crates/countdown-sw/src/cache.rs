//! Cache storage: named buckets of request/response snapshots.
//!
//! A bucket is named after a cache generation. Lookups are exact matches on
//! the normalized request key. Entries never expire; they live until their
//! bucket is deleted or the entry is removed explicitly.
//!
//! Storage is either purely in memory or backed by a directory holding one
//! JSON snapshot per bucket, rewritten after every mutation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use countdown_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{Result, ServiceWorkerError};

// ==================== Request Key ====================

/// Normalized request descriptor: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for an arbitrary method.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Key of an intercepted request.
    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Cache Entry ====================

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, duplicates preserved.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response. The response itself is left untouched.
    pub fn from_response(key: &RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::Cache(format!("corrupt status: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response::new(url, status, headers, self.body.clone()).cached())
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A single bucket.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Add entry; replaces any previous entry for the key.
    pub fn put(&mut self, key: RequestKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys, sorted.
    pub fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// On-disk form of a bucket.
#[derive(Serialize, Deserialize)]
struct PersistedCache {
    name: String,
    entries: Vec<CacheEntry>,
}

// ==================== Cache Storage ====================

/// Shared handle to every bucket. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
    dir: Option<PathBuf>,
    persist_lock: Arc<Mutex<()>>,
}

impl CacheStorage {
    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Storage persisted under `dir`, loading any buckets already there.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ServiceWorkerError::Cache(format!("create {}: {e}", dir.display())))?;

        let mut caches = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ServiceWorkerError::Cache(format!("read {}: {e}", dir.display())))?;

        while let Some(file) = read_dir
            .next_entry()
            .await
            .map_err(|e| ServiceWorkerError::Cache(e.to_string()))?
        {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_bucket(&path).await {
                Ok(cache) => {
                    debug!(bucket = %cache.name, entries = cache.len(), "Loaded bucket");
                    caches.insert(cache.name.clone(), cache);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bucket"),
            }
        }

        info!(dir = %dir.display(), buckets = caches.len(), "Cache storage loaded");

        Ok(Self {
            caches: Arc::new(RwLock::new(caches)),
            dir: Some(dir),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Whether mutations are written to disk.
    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Open a bucket, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) -> Result<CacheHandle> {
        let created = {
            let mut caches = self.caches.write().await;
            if caches.contains_key(name) {
                false
            } else {
                caches.insert(name.to_string(), Cache::new(name));
                true
            }
        };

        if created {
            debug!(bucket = %name, "Created bucket");
            self.persist(name).await?;
        }

        Ok(CacheHandle {
            name: name.to_string(),
            storage: self.clone(),
        })
    }

    /// Handle to a bucket without creating it. The bucket comes into
    /// existence on the first `put`.
    pub fn handle(&self, name: &str) -> CacheHandle {
        CacheHandle {
            name: name.to_string(),
            storage: self.clone(),
        }
    }

    /// Check if a bucket exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a bucket and everything in it.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self.caches.write().await.remove(name).is_some();
        if removed {
            self.persist(name).await?;
        }
        Ok(removed)
    }

    /// Get all bucket names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Match across all buckets.
    pub async fn match_request(&self, key: &RequestKey) -> Option<CacheEntry> {
        let caches = self.caches.read().await;
        let mut names: Vec<_> = caches.keys().collect();
        names.sort();
        names
            .into_iter()
            .find_map(|name| caches.get(name).and_then(|c| c.match_request(key)).cloned())
    }

    /// Write the current state of a bucket to disk, or remove its file if the
    /// bucket is gone. No-op for in-memory storage.
    async fn persist(&self, name: &str) -> Result<()> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };

        // Snapshot under the persist lock so files are written in mutation order.
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.caches.read().await.get(name).map(|cache| PersistedCache {
            name: cache.name.clone(),
            entries: cache.keys().iter().filter_map(|k| cache.match_request(k).cloned()).collect(),
        });

        let path = bucket_path(dir, name);
        match snapshot {
            Some(snapshot) => {
                let json = serde_json::to_vec_pretty(&snapshot)
                    .map_err(|e| ServiceWorkerError::Cache(e.to_string()))?;
                let tmp = path.with_extension("json.tmp");
                tokio::fs::write(&tmp, json)
                    .await
                    .map_err(|e| ServiceWorkerError::Cache(format!("write {}: {e}", tmp.display())))?;
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| ServiceWorkerError::Cache(format!("rename {}: {e}", path.display())))?;
                trace!(bucket = %name, path = %path.display(), "Bucket persisted");
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => trace!(bucket = %name, "Bucket file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ServiceWorkerError::Cache(format!(
                        "remove {}: {e}",
                        path.display()
                    )))
                }
            },
        }
        Ok(())
    }
}

fn bucket_path(dir: &Path, name: &str) -> PathBuf {
    let file: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{file}.json"))
}

async fn load_bucket(path: &Path) -> Result<Cache> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| ServiceWorkerError::Cache(e.to_string()))?;
    let persisted: PersistedCache =
        serde_json::from_slice(&raw).map_err(|e| ServiceWorkerError::Cache(e.to_string()))?;

    let mut cache = Cache::new(&persisted.name);
    for entry in persisted.entries {
        cache.put(entry.key(), entry);
    }
    Ok(cache)
}

// ==================== Cache Handle ====================

/// Handle to one bucket, as returned by [`CacheStorage::open`].
#[derive(Debug, Clone)]
pub struct CacheHandle {
    name: String,
    storage: CacheStorage,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact-match lookup in this bucket.
    pub async fn match_request(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.storage
            .caches
            .read()
            .await
            .get(&self.name)
            .and_then(|c| c.match_request(key))
            .cloned()
    }

    /// Store a snapshot of `response` under `key`.
    ///
    /// Only GET keys and 2xx responses are accepted. A bucket deleted while
    /// the handle was held is recreated.
    pub async fn put(&self, key: RequestKey, response: &Response) -> Result<()> {
        if !key.is_get() {
            return Err(ServiceWorkerError::Cache(format!(
                "only GET requests can be cached: {key}"
            )));
        }
        if !response.ok() {
            return Err(ServiceWorkerError::Cache(format!(
                "refusing to cache status {} for {key}",
                response.status
            )));
        }

        let entry = CacheEntry::from_response(&key, response);
        {
            let mut caches = self.storage.caches.write().await;
            caches
                .entry(self.name.clone())
                .or_insert_with(|| Cache::new(&self.name))
                .put(key.clone(), entry);
        }
        trace!(bucket = %self.name, key = %key, "Entry stored");

        self.storage.persist(&self.name).await
    }

    /// Remove one entry.
    pub async fn delete(&self, key: &RequestKey) -> Result<bool> {
        let removed = self
            .storage
            .caches
            .write()
            .await
            .get_mut(&self.name)
            .map(|c| c.delete(key))
            .unwrap_or(false);
        if removed {
            self.storage.persist(&self.name).await?;
        }
        Ok(removed)
    }

    /// Keys stored in this bucket.
    pub async fn keys(&self) -> Vec<RequestKey> {
        self.storage
            .caches
            .read()
            .await
            .get(&self.name)
            .map(|c| c.keys())
            .unwrap_or_default()
    }

    /// Number of entries in this bucket.
    pub async fn len(&self) -> usize {
        self.storage
            .caches
            .read()
            .await
            .get(&self.name)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn ok_response(u: &str, body: &'static str) -> Response {
        Response::with_content_type(url(u), "text/plain", body)
    }

    #[test]
    fn test_request_key_strips_fragment() {
        let a = RequestKey::get(&url("https://app.test/page#top"));
        let b = RequestKey::get(&url("https://app.test/page"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://app.test/page");
    }

    #[test]
    fn test_request_key_query_is_significant() {
        let a = RequestKey::get(&url("https://app.test/api/quote?category=motivation"));
        let b = RequestKey::get(&url("https://app.test/api/quote"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_entry_round_trips_headers_and_body() {
        let key = RequestKey::get(&url("https://app.test/a.css"));
        let response = Response::with_content_type(url("https://app.test/a.css"), "text/css", "body{}");
        let entry = CacheEntry::from_response(&key, &response);

        let rebuilt = entry.to_response().unwrap();
        assert!(rebuilt.from_cache);
        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.body(), &Bytes::from_static(b"body{}"));
        assert_eq!(rebuilt.content_type().unwrap().subtype(), "css");
        // the caller keeps a usable response
        assert_eq!(response.text().unwrap(), "body{}");
    }

    #[tokio::test]
    async fn test_put_and_exact_match() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let key = RequestKey::get(&url("https://app.test/style.css"));

        cache.put(key.clone(), &ok_response("https://app.test/style.css", "x")).await.unwrap();

        assert!(cache.match_request(&key).await.is_some());
        let other = RequestKey::get(&url("https://app.test/style.css.map"));
        assert!(cache.match_request(&other).await.is_none());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_put_rejects_non_get_and_errors() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();

        let post = RequestKey::new(&Method::POST, &url("https://app.test/api/quote"));
        assert!(cache.put(post, &ok_response("https://app.test/api/quote", "x")).await.is_err());

        let key = RequestKey::get(&url("https://app.test/missing"));
        let not_found = Response::new(
            url("https://app.test/missing"),
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            "",
        );
        assert!(cache.put(key, &not_found).await.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let key = RequestKey::get(&url("https://app.test/api/quote"));

        cache.put(key.clone(), &ok_response("https://app.test/api/quote", "first")).await.unwrap();
        cache.put(key.clone(), &ok_response("https://app.test/api/quote", "second")).await.unwrap();

        let entry = cache.match_request(&key).await.unwrap();
        assert_eq!(entry.body, b"second");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_storage_delete_and_keys() {
        let storage = CacheStorage::in_memory();
        storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();

        assert_eq!(storage.keys().await, vec!["v1".to_string(), "v2".to_string()]);
        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await);
        assert!(storage.has("v2").await);
    }

    #[tokio::test]
    async fn test_handle_does_not_create_bucket() {
        let storage = CacheStorage::in_memory();
        let handle = storage.handle("lazy");
        assert!(!storage.has("lazy").await);
        assert_eq!(handle.len().await, 0);

        let key = RequestKey::get(&url("https://app.test/a.js"));
        handle.put(key, &ok_response("https://app.test/a.js", "x")).await.unwrap();
        assert!(storage.has("lazy").await);
    }

    #[tokio::test]
    async fn test_storage_wide_match() {
        let storage = CacheStorage::in_memory();
        let key = RequestKey::get(&url("https://app.test/"));
        storage
            .open("v2")
            .await
            .unwrap()
            .put(key.clone(), &ok_response("https://app.test/", "shell"))
            .await
            .unwrap();

        assert!(storage.match_request(&key).await.is_some());
        storage.delete("v2").await.unwrap();
        assert!(storage.match_request(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_persistent_storage_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let key = RequestKey::get(&url("https://app.test/favicon.ico"));

        {
            let storage = CacheStorage::load(dir.path()).await.unwrap();
            assert!(storage.is_persistent());
            let cache = storage.open("gaokao-countdown-v1.0.0").await.unwrap();
            let response = Response::with_content_type(
                url("https://app.test/favicon.ico"),
                "image/x-icon",
                vec![0u8, 1, 2, 255],
            );
            cache.put(key.clone(), &response).await.unwrap();
        }

        let reloaded = CacheStorage::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.keys().await, vec!["gaokao-countdown-v1.0.0".to_string()]);
        let entry = reloaded.match_request(&key).await.unwrap();
        assert_eq!(entry.body, vec![0u8, 1, 2, 255]);
    }

    #[tokio::test]
    async fn test_persistent_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::load(dir.path()).await.unwrap();
        storage.open("old").await.unwrap();
        assert!(dir.path().join("old.json").exists());

        storage.delete("old").await.unwrap();
        assert!(!dir.path().join("old.json").exists());

        let reloaded = CacheStorage::load(dir.path()).await.unwrap();
        assert!(reloaded.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("caches");
        let storage = CacheStorage::load(&root).await.unwrap();
        let cache = storage.open("v1").await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();

        let key = RequestKey::get(&url("https://app.test/a.js"));
        let result = cache.put(key.clone(), &ok_response("https://app.test/a.js", "x")).await;
        assert!(matches!(result, Err(ServiceWorkerError::Cache(_))));
    }
}
