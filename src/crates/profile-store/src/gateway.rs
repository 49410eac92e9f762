//! Store gateway: retries, failure classification and health reporting
//!
//! Every backend call made by a store goes through [`StoreGateway`]. Transient
//! failures are retried with bounded exponential backoff
//! ([`RetryConfig`]); permanent failures surface immediately. Every failed
//! attempt is reported to the [`CriticalStateMonitor`] and to the process
//! `on_error` signal, every success clears the monitor's error chain.
//!
//! For updates, each retry calls the backend again, so the transform sees a
//! fresh current value on every attempt and must be safe to run repeatedly.

use crate::{
    backend::{KeyValueBackend, StoredValue, UpdateFn, UpdateResult, VersionListRequest, VersionPage},
    error::{ErrorClass, ProfileStoreError, Result},
    monitor::CriticalStateMonitor,
    retry::RetryConfig,
    signal::Signal,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Payload of the process-wide error signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreErrorEvent {
    pub message: String,
    pub store_name: String,
    pub key: String,
}

/// Retrying front for one store's backend
#[derive(Clone)]
pub struct StoreGateway {
    store_name: String,
    backend: Arc<dyn KeyValueBackend>,
    retry: RetryConfig,
    monitor: Arc<CriticalStateMonitor>,
    on_error: Signal<StoreErrorEvent>,
}

impl std::fmt::Debug for StoreGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGateway")
            .field("store_name", &self.store_name)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Attempt bookkeeping for one gateway call
struct Attempts<'a> {
    gateway: &'a StoreGateway,
    operation: &'static str,
    key: &'a str,
    attempt: u32,
}

impl Attempts<'_> {
    /// Account for a failed attempt. Sleeps and returns `Ok` when another
    /// attempt should be made, otherwise returns the error to surface.
    async fn failed(&mut self, err: ProfileStoreError) -> Result<()> {
        let gateway = self.gateway;
        let class = err.class();

        debug!(
            store = %gateway.store_name,
            key = self.key,
            operation = self.operation,
            attempt = self.attempt,
            error = %err,
            classification = ?class,
            "Store call failed"
        );

        gateway.monitor.record_error();
        gateway.on_error.fire(&StoreErrorEvent {
            message: err.to_string(),
            store_name: gateway.store_name.clone(),
            key: self.key.to_string(),
        });

        if class == ErrorClass::Permanent {
            error!(
                store = %gateway.store_name,
                key = self.key,
                operation = self.operation,
                error = %err,
                "Permanent store error, not retrying"
            );
            return Err(err);
        }

        if self.attempt >= gateway.retry.max_retries {
            error!(
                store = %gateway.store_name,
                key = self.key,
                operation = self.operation,
                attempts = self.attempt + 1,
                error = %err,
                "All retry attempts exhausted"
            );
            return Err(ProfileStoreError::RetriesExhausted {
                operation: self.operation.to_string(),
                attempts: self.attempt + 1,
                last_error: err.to_string(),
            });
        }

        let delay = gateway.retry.backoff_delay(self.attempt);
        warn!(
            store = %gateway.store_name,
            key = self.key,
            operation = self.operation,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Transient store error, will retry after delay"
        );
        tokio::time::sleep(delay).await;
        self.attempt += 1;
        Ok(())
    }
}

impl StoreGateway {
    pub fn new(
        store_name: impl Into<String>,
        backend: Arc<dyn KeyValueBackend>,
        retry: RetryConfig,
        monitor: Arc<CriticalStateMonitor>,
        on_error: Signal<StoreErrorEvent>,
    ) -> Self {
        Self {
            store_name: store_name.into(),
            backend,
            retry,
            monitor,
            on_error,
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// Same retry policy and reporting, different backend
    pub fn with_backend(&self, backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            ..self.clone()
        }
    }

    fn attempts<'a>(&'a self, operation: &'static str, key: &'a str) -> Attempts<'a> {
        Attempts {
            gateway: self,
            operation,
            key,
            attempt: 0,
        }
    }

    fn succeeded(&self) {
        self.monitor.record_success();
    }

    /// Atomic read-modify-write of `key` with retries
    pub async fn compare_and_swap(
        &self,
        key: &str,
        transform: &mut UpdateFn<'_>,
    ) -> Result<UpdateResult> {
        let mut attempts = self.attempts("update", key);
        loop {
            match self.backend.update(key, transform).await {
                Ok(result) => {
                    self.succeeded();
                    return Ok(result);
                }
                Err(e) => attempts.failed(e).await?,
            }
        }
    }

    /// Current value of `key` without modifying it
    pub async fn read(&self, key: &str) -> Result<Option<StoredValue>> {
        let mut attempts = self.attempts("read", key);
        loop {
            match self.backend.read(key).await {
                Ok(result) => {
                    self.succeeded();
                    return Ok(result);
                }
                Err(e) => attempts.failed(e).await?,
            }
        }
    }

    pub async fn list_versions(&self, key: &str, request: &VersionListRequest) -> Result<VersionPage> {
        let mut attempts = self.attempts("list_versions", key);
        loop {
            match self.backend.list_versions(key, request).await {
                Ok(page) => {
                    self.succeeded();
                    return Ok(page);
                }
                Err(e) => attempts.failed(e).await?,
            }
        }
    }

    pub async fn get_version(&self, key: &str, version: &str) -> Result<Option<StoredValue>> {
        let mut attempts = self.attempts("get_version", key);
        loop {
            match self.backend.get_version(key, version).await {
                Ok(result) => {
                    self.succeeded();
                    return Ok(result);
                }
                Err(e) => attempts.failed(e).await?,
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut attempts = self.attempts("remove", key);
        loop {
            match self.backend.remove(key).await {
                Ok(existed) => {
                    self.succeeded();
                    return Ok(existed);
                }
                Err(e) => attempts.failed(e).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileStoreConfig;
    use crate::memory::{FailureKind, InMemoryBackend};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway(backend: InMemoryBackend, max_retries: u32) -> StoreGateway {
        let config = ProfileStoreConfig::default();
        StoreGateway::new(
            "players",
            Arc::new(backend),
            RetryConfig::new(max_retries)
                .with_initial_backoff(100)
                .with_jitter(false),
            CriticalStateMonitor::new(&config),
            Signal::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let backend = InMemoryBackend::new();
        backend.fail_next(2, FailureKind::Transient);
        let gateway = gateway(backend.clone(), 3);

        let calls = AtomicUsize::new(0);
        let mut transform = |current: Option<&Value>| -> Option<Value> {
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(current.is_none());
            Some(json!({"n": 1}))
        };
        let result = gateway.compare_and_swap("k", &mut transform).await.unwrap();

        assert!(result.is_written());
        // Injected failures fire before the transform runs
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_surfaces_immediately() {
        let backend = InMemoryBackend::new();
        backend.fail_next(1, FailureKind::Permanent);
        let gateway = gateway(backend.clone(), 5);

        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        gateway.on_error.connect(move |event: &StoreErrorEvent| sink.lock().push(event.clone()));

        let err = gateway.read("k").await.unwrap_err();
        assert!(matches!(err, ProfileStoreError::Permanent(_)));

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].store_name, "players");
        assert_eq!(events[0].key, "k");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let backend = InMemoryBackend::new();
        backend.fail_next(10, FailureKind::Transient);
        let gateway = gateway(backend, 2);

        let err = gateway.remove("k").await.unwrap_err();
        match err {
            ProfileStoreError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(gateway.monitor.consecutive_errors(), 3);
    }
}
