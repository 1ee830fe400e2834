//! Cache Store: generation-scoped request/response storage.
//!
//! A generation is opened by name and every read or write goes through the
//! [`CacheHandle`] it returned. Entries never move between generations, and a
//! handle to a deleted generation fails with [`SwError::GenerationAbsent`]
//! instead of silently recreating it.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use ronin_net::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use url::Url;

use crate::SwError;

// ==================== Identity ====================

/// Version label naming one generation of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(String);

impl GenerationId {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GenerationId {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for GenerationId {
    fn from(label: String) -> Self {
        Self(label)
    }
}

/// Normalized identity of a cacheable request.
///
/// Only GET requests have one. The URL fragment is not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    /// Identity of a GET for `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    /// Identity of `request`, or `None` when it is not cacheable.
    pub fn from_request(request: &Request) -> Option<Self> {
        request.is_get().then(|| Self::get(&request.url))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A captured response stored in a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response status.
    pub status: u16,

    /// Response headers, in received order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Captured at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a fully received response.
    ///
    /// The body handle is duplicated, so the caller keeps a usable response.
    pub fn capture(response: &Response) -> Self {
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
            status: response.status.as_u16(),
            headers,
            body: response.body().clone(),
            cached_at: ronin_common::unix_millis(),
        }
    }

    /// Rebuild a response for `url` from this entry.
    pub fn to_response(&self, url: Url) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Response::new(url, status, headers, self.body.clone())
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Handles ====================

/// Access token for one opened generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    generation: GenerationId,
}

impl CacheHandle {
    /// Storage implementations mint handles from [`CacheStorage::open`].
    pub fn new(generation: GenerationId) -> Self {
        Self { generation }
    }

    pub fn generation(&self) -> &GenerationId {
        &self.generation
    }
}

// ==================== Storage ====================

/// Named, versioned key-value storage of captured responses.
///
/// Implementations must be safe for concurrent access to independent keys.
/// Within one key the last completed `put` wins.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it empty if it does not exist.
    async fn open(&self, generation: &GenerationId) -> Result<CacheHandle, SwError>;

    /// Read an entry from the handle's generation.
    async fn get(
        &self,
        handle: &CacheHandle,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, SwError>;

    /// Write an entry, replacing any previous value for the key.
    async fn put(
        &self,
        handle: &CacheHandle,
        key: RequestKey,
        entry: CacheEntry,
    ) -> Result<(), SwError>;

    /// Delete a whole generation. Returns `false` if it did not exist.
    async fn delete(&self, generation: &GenerationId) -> Result<bool, SwError>;

    /// All generation ids, sorted.
    async fn generations(&self) -> Result<Vec<GenerationId>, SwError>;

    /// All request identities stored in the handle's generation.
    async fn keys(&self, handle: &CacheHandle) -> Result<Vec<RequestKey>, SwError>;

    /// Whether a generation exists.
    async fn contains(&self, generation: &GenerationId) -> Result<bool, SwError> {
        Ok(self.generations().await?.contains(generation))
    }
}

type Generation = HashMap<RequestKey, CacheEntry>;

/// Generation maps shared by the storage backends.
#[derive(Debug, Default)]
struct GenerationMap {
    caches: HashMap<GenerationId, Generation>,
}

impl GenerationMap {
    fn open(&mut self, generation: &GenerationId) -> bool {
        if self.caches.contains_key(generation) {
            return false;
        }
        self.caches.insert(generation.clone(), Generation::new());
        true
    }

    fn generation(&self, handle: &CacheHandle) -> Result<&Generation, SwError> {
        self.caches
            .get(handle.generation())
            .ok_or_else(|| SwError::GenerationAbsent(handle.generation().clone()))
    }

    fn get(&self, handle: &CacheHandle, key: &RequestKey) -> Result<Option<CacheEntry>, SwError> {
        Ok(self.generation(handle)?.get(key).cloned())
    }

    fn put(&mut self, handle: &CacheHandle, key: RequestKey, entry: CacheEntry) -> Result<(), SwError> {
        let cache = self
            .caches
            .get_mut(handle.generation())
            .ok_or_else(|| SwError::GenerationAbsent(handle.generation().clone()))?;
        cache.insert(key, entry);
        Ok(())
    }

    fn delete(&mut self, generation: &GenerationId) -> bool {
        self.caches.remove(generation).is_some()
    }

    fn generations(&self) -> Vec<GenerationId> {
        let mut ids: Vec<GenerationId> = self.caches.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn keys(&self, handle: &CacheHandle) -> Result<Vec<RequestKey>, SwError> {
        Ok(self.generation(handle)?.keys().cloned().collect())
    }
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    inner: RwLock<GenerationMap>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, generation: &GenerationId) -> Result<CacheHandle, SwError> {
        if self.inner.write().await.open(generation) {
            debug!(generation = %generation, "Created cache generation");
        }
        Ok(CacheHandle::new(generation.clone()))
    }

    async fn get(
        &self,
        handle: &CacheHandle,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, SwError> {
        self.inner.read().await.get(handle, key)
    }

    async fn put(
        &self,
        handle: &CacheHandle,
        key: RequestKey,
        entry: CacheEntry,
    ) -> Result<(), SwError> {
        trace!(generation = %handle.generation(), key = %key, "Cache put");
        self.inner.write().await.put(handle, key, entry)
    }

    async fn delete(&self, generation: &GenerationId) -> Result<bool, SwError> {
        Ok(self.inner.write().await.delete(generation))
    }

    async fn generations(&self) -> Result<Vec<GenerationId>, SwError> {
        Ok(self.inner.read().await.generations())
    }

    async fn keys(&self, handle: &CacheHandle) -> Result<Vec<RequestKey>, SwError> {
        self.inner.read().await.keys(handle)
    }
}

/// On-disk layout of one generation.
#[derive(Debug, Serialize, Deserialize)]
struct GenerationFile {
    generation: GenerationId,
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    entry: CacheEntry,
}

/// Cache storage persisted as one JSON document per generation.
///
/// Documents are written to a temporary file and renamed into place, so a
/// reader never sees a half-written generation. Memory is only updated once
/// the disk write has landed.
///
/// Every `put` rewrites the whole generation document under the store-wide
/// write lock, so reads wait on disk I/O that grows with the generation.
/// Suited to small asset sets like an app shell, not bulk caching.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    inner: RwLock<GenerationMap>,
}

impl DiskCacheStorage {
    /// Open (or create) a storage directory and load every generation in it.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self, SwError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut map = GenerationMap::default();
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_file(&path).await {
                Ok(file) => {
                    let cache = file
                        .entries
                        .into_iter()
                        .map(|stored| (stored.key, stored.entry))
                        .collect();
                    map.caches.insert(file.generation, cache);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache generation");
                }
            }
        }

        debug!(root = %root.display(), generations = map.caches.len(), "Disk cache loaded");

        Ok(Self {
            root,
            inner: RwLock::new(map),
        })
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_file(path: &Path) -> Result<GenerationFile, SwError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn path_for(&self, generation: &GenerationId) -> PathBuf {
        self.root
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(generation.as_str())))
    }

    async fn persist<'a>(
        &self,
        generation: &GenerationId,
        entries: impl Iterator<Item = (&'a RequestKey, &'a CacheEntry)>,
    ) -> Result<(), SwError> {
        let file = GenerationFile {
            generation: generation.clone(),
            entries: entries
                .map(|(key, entry)| StoredEntry {
                    key: key.clone(),
                    entry: entry.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&file)?;

        let path = self.path_for(generation);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, generation: &GenerationId) -> Result<CacheHandle, SwError> {
        let mut map = self.inner.write().await;
        if !map.caches.contains_key(generation) {
            self.persist(generation, std::iter::empty::<(&RequestKey, &CacheEntry)>())
                .await?;
            map.open(generation);
            debug!(generation = %generation, "Created cache generation on disk");
        }
        Ok(CacheHandle::new(generation.clone()))
    }

    async fn get(
        &self,
        handle: &CacheHandle,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, SwError> {
        self.inner.read().await.get(handle, key)
    }

    async fn put(
        &self,
        handle: &CacheHandle,
        key: RequestKey,
        entry: CacheEntry,
    ) -> Result<(), SwError> {
        // Held across the write so memory and disk agree on the last writer.
        let mut map = self.inner.write().await;
        trace!(generation = %handle.generation(), key = %key, "Cache put");
        let cache = map.generation(handle)?;
        let others = cache.iter().filter(|(k, _)| **k != key);
        self.persist(handle.generation(), others.chain(std::iter::once((&key, &entry))))
            .await?;
        map.put(handle, key, entry)
    }

    async fn delete(&self, generation: &GenerationId) -> Result<bool, SwError> {
        let mut map = self.inner.write().await;
        if !map.caches.contains_key(generation) {
            return Ok(false);
        }
        match tokio::fs::remove_file(self.path_for(generation)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(map.delete(generation))
    }

    async fn generations(&self) -> Result<Vec<GenerationId>, SwError> {
        Ok(self.inner.read().await.generations())
    }

    async fn keys(&self, handle: &CacheHandle) -> Result<Vec<RequestKey>, SwError> {
        self.inner.read().await.keys(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(body: &'static str) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: Bytes::from_static(body.as_bytes()),
            cached_at: 1,
        }
    }

    #[test]
    fn test_request_key_ignores_fragment() {
        let a = RequestKey::get(&url("https://app.test/index.html#top"));
        let b = RequestKey::get(&url("https://app.test/index.html"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://app.test/index.html");
    }

    #[test]
    fn test_request_key_is_get_only() {
        let get = Request::get(url("https://app.test/a"));
        let post = Request::post(url("https://app.test/a"), Bytes::new());
        assert!(RequestKey::from_request(&get).is_some());
        assert!(RequestKey::from_request(&post).is_none());
    }

    #[test]
    fn test_capture_round_trips_through_response() {
        let response = Response::html(url("https://app.test/"), "<h1>hi</h1>");
        let captured = CacheEntry::capture(&response);

        assert_eq!(captured.status, 200);
        assert!(captured.cached_at > 0);

        let rebuilt = captured.to_response(url("https://app.test/"));
        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.body(), response.body());
        assert_eq!(rebuilt.headers.get("content-type").unwrap(), "text/html");
    }

    #[test]
    fn test_entry_body_serializes_as_base64() {
        let json = serde_json::to_value(entry("abc")).unwrap();
        assert_eq!(json["body"], "YWJj");
        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry("abc"));
    }

    #[tokio::test]
    async fn test_memory_put_get() {
        let storage = MemoryCacheStorage::new();
        let handle = storage.open(&"v1".into()).await.unwrap();
        let key = RequestKey::get(&url("https://app.test/index.html"));

        assert_eq!(storage.get(&handle, &key).await.unwrap(), None);
        storage.put(&handle, key.clone(), entry("one")).await.unwrap();
        assert_eq!(storage.get(&handle, &key).await.unwrap(), Some(entry("one")));

        storage.put(&handle, key.clone(), entry("two")).await.unwrap();
        assert_eq!(storage.get(&handle, &key).await.unwrap(), Some(entry("two")));
        assert_eq!(storage.keys(&handle).await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_generations_are_isolated() {
        let storage = MemoryCacheStorage::new();
        let v1 = storage.open(&"v1".into()).await.unwrap();
        let v2 = storage.open(&"v2".into()).await.unwrap();
        let key = RequestKey::get(&url("https://app.test/app.js"));

        storage.put(&v1, key.clone(), entry("old")).await.unwrap();
        assert_eq!(storage.get(&v2, &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let storage = MemoryCacheStorage::new();
        let handle = storage.open(&"v1".into()).await.unwrap();
        let key = RequestKey::get(&url("https://app.test/a"));
        storage.put(&handle, key.clone(), entry("kept")).await.unwrap();

        let again = storage.open(&"v1".into()).await.unwrap();
        assert_eq!(again, handle);
        assert_eq!(storage.get(&again, &key).await.unwrap(), Some(entry("kept")));
    }

    #[tokio::test]
    async fn test_delete_makes_handle_absent() {
        let storage = MemoryCacheStorage::new();
        let handle = storage.open(&"v1".into()).await.unwrap();
        let key = RequestKey::get(&url("https://app.test/a"));

        assert!(storage.delete(&"v1".into()).await.unwrap());
        assert!(matches!(
            storage.get(&handle, &key).await,
            Err(SwError::GenerationAbsent(_))
        ));
        assert!(matches!(
            storage.put(&handle, key, entry("late")).await,
            Err(SwError::GenerationAbsent(_))
        ));
        assert!(storage.generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let storage = MemoryCacheStorage::new();
        assert!(!storage.delete(&"nope".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_generations_sorted() {
        let storage = MemoryCacheStorage::new();
        storage.open(&"v2".into()).await.unwrap();
        storage.open(&"v1".into()).await.unwrap();
        assert_eq!(
            storage.generations().await.unwrap(),
            vec![GenerationId::from("v1"), GenerationId::from("v2")]
        );
        assert!(storage.contains(&"v2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_storage_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let key = RequestKey::get(&url("https://app.test/index.html"));

        {
            let storage = DiskCacheStorage::open_dir(dir.path()).await.unwrap();
            let handle = storage.open(&"ronins-maths-v4.0".into()).await.unwrap();
            storage.put(&handle, key.clone(), entry("persisted")).await.unwrap();
            storage.open(&"empty".into()).await.unwrap();
        }

        let storage = DiskCacheStorage::open_dir(dir.path()).await.unwrap();
        assert_eq!(
            storage.generations().await.unwrap(),
            vec![GenerationId::from("empty"), GenerationId::from("ronins-maths-v4.0")]
        );
        let handle = storage.open(&"ronins-maths-v4.0".into()).await.unwrap();
        assert_eq!(storage.get(&handle, &key).await.unwrap(), Some(entry("persisted")));
    }

    #[tokio::test]
    async fn test_disk_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::open_dir(dir.path()).await.unwrap();
        storage.open(&"v1".into()).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        assert!(storage.delete(&"v1".into()).await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let reloaded = DiskCacheStorage::open_dir(dir.path()).await.unwrap();
        assert!(reloaded.generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::open_dir(dir.path()).await.unwrap();
        let handle = storage.open(&"v1".into()).await.unwrap();
        let key = RequestKey::get(&url("https://app.test/index.html"));

        // A non-empty directory where the document goes makes the rename fail.
        let path = storage.path_for(&"v1".into());
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"").unwrap();

        assert!(storage.put(&handle, key.clone(), entry("lost")).await.is_err());
        assert_eq!(storage.get(&handle, &key).await.unwrap(), None);
        assert!(!path.with_extension("json.tmp").exists());

        assert!(storage.delete(&"v1".into()).await.is_err());
        assert!(storage.contains(&"v1".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_skips_corrupt_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("half.json.tmp"), b"{").unwrap();

        let storage = DiskCacheStorage::open_dir(dir.path()).await.unwrap();
        assert!(storage.generations().await.unwrap().is_empty());
    }
}
