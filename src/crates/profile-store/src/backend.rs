//! Key-value backend abstraction
//!
//! The backend is the only shared resource between processes. It must offer
//! an atomic read-modify-write per key ([`KeyValueBackend::update`]), a
//! paginated listing of historical versions, a read of one historical
//! version, and deletion. Everything else (locking, heartbeats, messaging)
//! is built on top by this crate.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use profile_store::backend::*;
//! use profile_store::Result;
//!
//! struct DynamoBackend { /* client */ }
//!
//! #[async_trait]
//! impl KeyValueBackend for DynamoBackend {
//!     async fn update(&self, key: &str, transform: &mut UpdateFn<'_>) -> Result<UpdateResult> {
//!         // read item + version, call transform, conditional put on version,
//!         // re-read and call transform again when the condition fails
//!         todo!()
//!     }
//!     // list_versions, get_version, remove ...
//! }
//! ```
//!
//! Errors must be reported as [`ProfileStoreError::Transient`] or
//! [`ProfileStoreError::Permanent`](crate::ProfileStoreError::Permanent) so
//! the gateway can decide whether to retry.
//!
//! [`ProfileStoreError::Transient`]: crate::ProfileStoreError::Transient

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Store-assigned version information for a value.
///
/// Opaque to this crate: supplied by the backend, never authored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A raw stored value together with its version information
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: Value,
    pub key_info: KeyInfo,
}

/// Transform applied atomically to the current value of a key.
///
/// Receives the current value (`None` when the key holds nothing) and returns
/// the replacement, or `None` to leave the key untouched. It may be invoked
/// several times for one update with different current values.
pub type UpdateFn<'a> = dyn FnMut(Option<&Value>) -> Option<Value> + Send + 'a;

/// Outcome of an atomic update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    /// The transform produced a value and it was stored
    Written(StoredValue),
    /// The transform declined; carries the current value, if any
    Unchanged(Option<StoredValue>),
}

impl UpdateResult {
    pub fn stored(&self) -> Option<&StoredValue> {
        match self {
            UpdateResult::Written(stored) => Some(stored),
            UpdateResult::Unchanged(stored) => stored.as_ref(),
        }
    }

    pub fn into_stored(self) -> Option<StoredValue> {
        match self {
            UpdateResult::Written(stored) => Some(stored),
            UpdateResult::Unchanged(stored) => stored,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, UpdateResult::Written(_))
    }
}

/// Ordering for version listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// One page request of a version listing
#[derive(Debug, Clone, Default)]
pub struct VersionListRequest {
    pub direction: SortDirection,
    /// Inclusive lower bound on version creation time
    pub min_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on version creation time
    pub max_date: Option<DateTime<Utc>>,
    /// Cursor returned by the previous page
    pub cursor: Option<String>,
    pub page_size: usize,
}

/// Summary of one historical version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub created_at: DateTime<Utc>,
}

/// One page of a version listing
#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    pub versions: Vec<VersionInfo>,
    /// Cursor for the next page, `None` when the listing is exhausted
    pub next_cursor: Option<String>,
}

/// Remote key-value store with per-key atomic updates
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Atomically replace the value of `key` with the output of `transform`
    async fn update(&self, key: &str, transform: &mut UpdateFn<'_>) -> Result<UpdateResult>;

    /// List historical versions of `key`, one page at a time
    async fn list_versions(&self, key: &str, request: &VersionListRequest) -> Result<VersionPage>;

    /// Read one historical version of `key`
    async fn get_version(&self, key: &str, version: &str) -> Result<Option<StoredValue>>;

    /// Delete `key` entirely. Returns whether anything was stored.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Read the current value without modifying it
    async fn read(&self, key: &str) -> Result<Option<StoredValue>> {
        let mut decline = |_: Option<&Value>| -> Option<Value> { None };
        Ok(self.update(key, &mut decline).await?.into_stored())
    }
}
