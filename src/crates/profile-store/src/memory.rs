//! In-memory backend for development, testing and mock stores
//!
//! [`InMemoryBackend`] keeps the full version history of every key behind a
//! `tokio::sync::RwLock`, which makes each update an atomic
//! read-modify-write exactly like a remote compare-and-swap store.
//!
//! It doubles as the simulated store for tests:
//!
//! - [`InMemoryBackend::fail_next`] injects transient or permanent failures
//!   into the next calls
//! - [`InMemoryBackend::with_latency`] delays every call so concurrent
//!   updates from several simulated processes interleave
//! - [`InMemoryBackend::write_count`] counts successful writes
//!
//! ```rust
//! use profile_store::{InMemoryBackend, KeyValueBackend};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> profile_store::Result<()> {
//!     let backend = InMemoryBackend::new();
//!     let mut put = |_: Option<&Value>| -> Option<Value> { Some(json!({"n": 1})) };
//!     backend.update("key", &mut put).await?;
//!     assert_eq!(backend.read("key").await?.unwrap().value, json!({"n": 1}));
//!     Ok(())
//! }
//! ```

use crate::{
    backend::{
        KeyInfo, KeyValueBackend, SortDirection, StoredValue, UpdateFn, UpdateResult,
        VersionInfo, VersionListRequest, VersionPage,
    },
    clock::Clock,
    error::{ProfileStoreError, Result},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Kind of failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// One stored version of a key
#[derive(Debug, Clone)]
struct VersionEntry {
    version: String,
    value: serde_json::Value,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct KeyHistory {
    entries: Vec<VersionEntry>,
    next_version: u64,
}

impl KeyHistory {
    fn latest(&self) -> Option<StoredValue> {
        let first = self.entries.first()?;
        let last = self.entries.last()?;
        Some(StoredValue {
            value: last.value.clone(),
            key_info: KeyInfo {
                version: last.version.clone(),
                created_at: first.created_at,
                updated_at: last.created_at,
            },
        })
    }
}

/// Thread-safe in-memory version storage
type VersionStorage = Arc<RwLock<HashMap<String, KeyHistory>>>;

/// In-memory key-value backend with version history and fault injection
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    storage: VersionStorage,
    clock: Clock,
    latency: Option<Duration>,
    failures: Arc<Mutex<VecDeque<FailureKind>>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryBackend {
    /// Create a new in-memory backend using the system clock
    pub fn new() -> Self {
        Self::with_clock(Clock::system())
    }

    /// Create a backend that timestamps versions with `clock`
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            clock,
            latency: None,
            failures: Arc::new(Mutex::new(VecDeque::new())),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `count` calls fail with `kind`
    pub fn fail_next(&self, count: usize, kind: FailureKind) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat(kind).take(count));
    }

    /// Drop any injected failures that have not fired yet
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Number of successful writes across all keys
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of keys currently stored
    pub async fn key_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Number of versions stored for `key`
    pub async fn version_count(&self, key: &str) -> usize {
        self.storage
            .read()
            .await
            .get(key)
            .map(|history| history.entries.len())
            .unwrap_or(0)
    }

    /// Remove every key (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    async fn enter(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let injected = self.failures.lock().pop_front();
        match injected {
            Some(FailureKind::Transient) => Err(ProfileStoreError::Transient(
                "injected transient failure".to_string(),
            )),
            Some(FailureKind::Permanent) => Err(ProfileStoreError::Permanent(
                "injected permanent failure".to_string(),
            )),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryBackend {
    async fn update(&self, key: &str, transform: &mut UpdateFn<'_>) -> Result<UpdateResult> {
        self.enter().await?;

        let mut storage = self.storage.write().await;
        let current = storage.get(key).and_then(KeyHistory::latest);

        let next = match transform(current.as_ref().map(|stored| &stored.value)) {
            Some(next) => next,
            None => return Ok(UpdateResult::Unchanged(current)),
        };

        let history = storage.entry(key.to_string()).or_default();
        history.next_version += 1;
        history.entries.push(VersionEntry {
            version: format!("{:016}", history.next_version),
            value: next,
            created_at: self.clock.now(),
        });
        self.writes.fetch_add(1, Ordering::SeqCst);

        let stored = history
            .latest()
            .ok_or_else(|| ProfileStoreError::Permanent("version history vanished".to_string()))?;
        Ok(UpdateResult::Written(stored))
    }

    async fn list_versions(&self, key: &str, request: &VersionListRequest) -> Result<VersionPage> {
        self.enter().await?;

        let storage = self.storage.read().await;
        let mut matching: Vec<VersionInfo> = storage
            .get(key)
            .map(|history| {
                history
                    .entries
                    .iter()
                    .filter(|entry| request.min_date.map_or(true, |min| entry.created_at >= min))
                    .filter(|entry| request.max_date.map_or(true, |max| entry.created_at <= max))
                    .map(|entry| VersionInfo {
                        version: entry.version.clone(),
                        created_at: entry.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if request.direction == SortDirection::Descending {
            matching.reverse();
        }

        let offset = match &request.cursor {
            Some(cursor) => cursor.parse::<usize>().map_err(|_| {
                ProfileStoreError::Permanent(format!("invalid version cursor: {}", cursor))
            })?,
            None => 0,
        };
        let page_size = request.page_size.max(1);
        let end = (offset + page_size).min(matching.len());
        let versions = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < matching.len()).then(|| end.to_string());

        Ok(VersionPage {
            versions,
            next_cursor,
        })
    }

    async fn get_version(&self, key: &str, version: &str) -> Result<Option<StoredValue>> {
        self.enter().await?;

        let storage = self.storage.read().await;
        let Some(history) = storage.get(key) else {
            return Ok(None);
        };
        let created_at = match history.entries.first() {
            Some(first) => first.created_at,
            None => return Ok(None),
        };

        Ok(history
            .entries
            .iter()
            .find(|entry| entry.version == version)
            .map(|entry| StoredValue {
                value: entry.value.clone(),
                key_info: KeyInfo {
                    version: entry.version.clone(),
                    created_at,
                    updated_at: entry.created_at,
                },
            }))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.enter().await?;
        Ok(self.storage.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    async fn put(backend: &InMemoryBackend, key: &str, value: Value) -> UpdateResult {
        let mut write = move |_: Option<&Value>| -> Option<Value> { Some(value.clone()) };
        backend.update(key, &mut write).await.unwrap()
    }

    #[tokio::test]
    async fn test_update_and_read() {
        let backend = InMemoryBackend::new();
        assert!(backend.read("missing").await.unwrap().is_none());

        let result = put(&backend, "k", json!({"a": 1})).await;
        assert!(result.is_written());

        let stored = backend.read("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!({"a": 1}));
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_declined_update_keeps_value() {
        let backend = InMemoryBackend::new();
        put(&backend, "k", json!(1)).await;

        let mut decline = |current: Option<&Value>| -> Option<Value> {
            assert_eq!(current, Some(&json!(1)));
            None
        };
        let result = backend.update("k", &mut decline).await.unwrap();

        assert!(!result.is_written());
        assert_eq!(result.stored().unwrap().value, json!(1));
        assert_eq!(backend.version_count("k").await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = InMemoryBackend::new();
        backend.fail_next(1, FailureKind::Transient);
        backend.fail_next(1, FailureKind::Permanent);

        let first = backend.read("k").await.unwrap_err();
        assert!(first.is_transient());
        let second = backend.read("k").await.unwrap_err();
        assert!(!second.is_transient());
        assert!(backend.read("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_version_listing_pages() {
        let backend = InMemoryBackend::new();
        for i in 0..5 {
            put(&backend, "k", json!(i)).await;
        }

        let mut request = VersionListRequest {
            direction: SortDirection::Descending,
            page_size: 2,
            ..Default::default()
        };
        let mut seen = Vec::new();
        loop {
            let page = backend.list_versions("k", &request).await.unwrap();
            seen.extend(page.versions.into_iter().map(|v| v.version));
            match page.next_cursor {
                Some(cursor) => request.cursor = Some(cursor),
                None => break,
            }
        }

        assert_eq!(seen.len(), 5);
        let oldest = backend.get_version("k", &seen[4]).await.unwrap().unwrap();
        assert_eq!(oldest.value, json!(0));
    }

    #[tokio::test]
    async fn test_remove() {
        let backend = InMemoryBackend::new();
        put(&backend, "k", json!(1)).await;

        assert!(backend.remove("k").await.unwrap());
        assert!(!backend.remove("k").await.unwrap());
        assert_eq!(backend.key_count().await, 0);
    }
}
