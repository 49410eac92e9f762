//! Simulated multi-process cluster over one in-memory store

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use profile_store::{
    document, Clock, Document, InMemoryBackend, KeyValueBackend, LocalNotifier, ProfileRuntime,
    ProfileStoreConfig, RetryConfig, SessionMarker, StartSessionOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub const KEY: &str = "player-1";

pub fn template() -> Value {
    json!({"coins": 0, "items": [], "settings": {"music": true}})
}

/// Production timings with deterministic retries
pub fn config() -> ProfileStoreConfig {
    ProfileStoreConfig::default().with_retry_config(
        RetryConfig::new(4)
            .with_initial_backoff(100)
            .with_max_backoff(1_000)
            .with_jitter(false),
    )
}

pub fn options() -> StartSessionOptions {
    StartSessionOptions::new()
}

/// Processes sharing one store, one notifier and one clock.
///
/// Must be created inside a paused tokio runtime.
pub struct Cluster {
    pub backend: Arc<InMemoryBackend>,
    pub notifier: Arc<LocalNotifier>,
    pub clock: Clock,
    pub config: ProfileStoreConfig,
}

impl Cluster {
    pub fn new(config: ProfileStoreConfig) -> Self {
        let clock = Clock::tokio();
        Self {
            backend: Arc::new(InMemoryBackend::with_clock(clock)),
            notifier: Arc::new(LocalNotifier::new()),
            clock,
            config,
        }
    }

    pub fn with_backend(config: ProfileStoreConfig, backend: InMemoryBackend, clock: Clock) -> Self {
        Self {
            backend: Arc::new(backend),
            notifier: Arc::new(LocalNotifier::new()),
            clock,
            config,
        }
    }

    pub fn process(&self, name: &str) -> ProfileRuntime {
        ProfileRuntime::builder()
            .owner_id("test-place")
            .instance_id(name)
            .config(self.config.clone())
            .clock(self.clock)
            .backend(self.backend.clone())
            .notifier(self.notifier.clone())
            .build()
            .unwrap()
    }

    /// Process that never hears notifications and relies on polling
    pub fn deaf_process(&self, name: &str) -> ProfileRuntime {
        ProfileRuntime::builder()
            .owner_id("test-place")
            .instance_id(name)
            .config(self.config.clone())
            .clock(self.clock)
            .backend(self.backend.clone())
            .build()
            .unwrap()
    }

    /// Leave a lock behind as a process that stopped responding would
    pub async fn write_phantom_owner(&self, key: &str, owner: &str, heartbeat: DateTime<Utc>) {
        let mut doc = Document::new(json!({"coins": 99}), heartbeat);
        doc.metadata.active_session = Some(SessionMarker::new("test-place", owner));
        doc.metadata.session_load_count = 3;
        self.put(key, document::encode(&doc).unwrap()).await;
    }

    /// Replace the stored value of `key` directly
    pub async fn put(&self, key: &str, value: Value) {
        let mut write = move |_: Option<&Value>| -> Option<Value> { Some(value.clone()) };
        self.backend.update(key, &mut write).await.unwrap();
    }

    pub async fn stored(&self, key: &str) -> Document {
        let stored = self.backend.read(key).await.unwrap().unwrap();
        document::decode(&stored.value, &template(), self.clock.now()).document
    }
}
