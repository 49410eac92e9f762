//! Process context shared by every store
//!
//! One [`ProfileRuntime`] stands for one server process: it owns the
//! session marker written into documents, the closing and critical-state
//! flags, the process-wide signals and the registry of sessions active in
//! this process. Several runtimes can share a backend and a notifier, which
//! is how tests simulate multiple processes.

use crate::{
    clock::Clock,
    config::ProfileStoreConfig,
    document::SessionMarker,
    error::{ProfileStoreError, Result},
    gateway::{StoreErrorEvent, StoreGateway},
    memory::InMemoryBackend,
    backend::KeyValueBackend,
    monitor::CriticalStateMonitor,
    notifier::{NoopNotifier, Notifier},
    profile::{LastSaveReason, Profile},
    signal::Signal,
    store::ProfileStore,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Whether the backing service is reachable and usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStoreState {
    NotReady,
    NoInternet,
    NoAccess,
    Access,
}

/// Payload of the `on_overwrite` signal: a stored value failed validation
/// and was salvaged or replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverwriteEvent {
    pub store_name: String,
    pub key: String,
    pub issues: Vec<String>,
}

/// Identifies a session slot in the registry: (store scope, key)
type SessionKey = (String, String);

/// Registry slot: reserved while acquiring, filled once active
enum Slot {
    Acquiring,
    Active(Profile),
}

const PROBE_KEY: &str = "__profile_store_probe";

pub(crate) struct RuntimeInner {
    pub(crate) config: ProfileStoreConfig,
    pub(crate) marker: SessionMarker,
    pub(crate) clock: Clock,
    pub(crate) backend: Arc<dyn KeyValueBackend>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) monitor: Arc<CriticalStateMonitor>,
    closing: watch::Sender<bool>,
    on_closing: Signal<bool>,
    pub(crate) on_error: Signal<StoreErrorEvent>,
    pub(crate) on_overwrite: Signal<OverwriteEvent>,
    data_store_state: Mutex<DataStoreState>,
    sessions: Mutex<HashMap<SessionKey, Slot>>,
}

/// Handle to the process context. Cheap to clone.
#[derive(Clone)]
pub struct ProfileRuntime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for ProfileRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRuntime")
            .field("marker", &self.inner.marker)
            .field("is_closing", &self.is_closing())
            .finish()
    }
}

/// Builder for [`ProfileRuntime`]
pub struct ProfileRuntimeBuilder {
    owner_id: String,
    instance_id: Option<String>,
    config: Option<ProfileStoreConfig>,
    clock: Clock,
    backend: Option<Arc<dyn KeyValueBackend>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ProfileRuntimeBuilder {
    /// Identifier of the deployment this process belongs to
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Fixed instance identifier, a random UUID otherwise
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn config(mut self, config: ProfileStoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the configuration and build the runtime.
    ///
    /// Without an explicit backend the runtime keeps its data in memory.
    pub fn build(self) -> Result<ProfileRuntime> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if self.owner_id.is_empty() {
            return Err(ProfileStoreError::InvalidConfig(
                "owner_id must not be empty".to_string(),
            ));
        }

        let instance_id = self
            .instance_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemoryBackend::with_clock(self.clock)));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(NoopNotifier::new()));
        let (closing, _rx) = watch::channel(false);

        Ok(ProfileRuntime {
            inner: Arc::new(RuntimeInner {
                monitor: CriticalStateMonitor::new(&config),
                marker: SessionMarker::new(self.owner_id, instance_id),
                config,
                clock: self.clock,
                backend,
                notifier,
                closing,
                on_closing: Signal::new(),
                on_error: Signal::new(),
                on_overwrite: Signal::new(),
                data_store_state: Mutex::new(DataStoreState::NotReady),
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl ProfileRuntime {
    pub fn builder() -> ProfileRuntimeBuilder {
        ProfileRuntimeBuilder {
            owner_id: "local".to_string(),
            instance_id: None,
            config: None,
            clock: Clock::System,
            backend: None,
            notifier: None,
        }
    }

    /// Open a store named `name`. `template` is the payload of profiles
    /// that have never been written.
    pub fn store(&self, name: impl Into<String>, template: Value) -> ProfileStore {
        ProfileStore::new(self.clone(), name.into(), template)
    }

    pub fn config(&self) -> &ProfileStoreConfig {
        &self.inner.config
    }

    /// Marker this process writes into documents it owns
    pub fn marker(&self) -> &SessionMarker {
        &self.inner.marker
    }

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    pub fn is_closing(&self) -> bool {
        *self.inner.closing.borrow()
    }

    /// Watch the closing flag
    pub fn subscribe_closing(&self) -> watch::Receiver<bool> {
        self.inner.closing.subscribe()
    }

    /// Fired once when the process starts closing
    pub fn on_closing_toggle(&self) -> &Signal<bool> {
        &self.inner.on_closing
    }

    pub fn is_critical(&self) -> bool {
        self.inner.monitor.is_critical()
    }

    /// Watch the critical-state flag
    pub fn subscribe_critical(&self) -> watch::Receiver<bool> {
        self.inner.monitor.subscribe()
    }

    /// Fired with the new value whenever critical state toggles
    pub fn on_critical_toggle(&self) -> &Signal<bool> {
        self.inner.monitor.on_toggle()
    }

    /// Fired for every failed store call
    pub fn on_error(&self) -> &Signal<StoreErrorEvent> {
        &self.inner.on_error
    }

    /// Fired when a stored value is corrupt and gets salvaged
    pub fn on_overwrite(&self) -> &Signal<OverwriteEvent> {
        &self.inner.on_overwrite
    }

    pub fn data_store_state(&self) -> DataStoreState {
        *self.inner.data_store_state.lock()
    }

    /// Resolve [`DataStoreState`] with one read. Once resolved the state
    /// never changes.
    pub async fn probe_access(&self) -> DataStoreState {
        let current = self.data_store_state();
        if current != DataStoreState::NotReady {
            return current;
        }

        let resolved = match self.inner.backend.read(PROBE_KEY).await {
            Ok(_) => DataStoreState::Access,
            Err(e) if e.is_transient() => DataStoreState::NoInternet,
            Err(_) => DataStoreState::NoAccess,
        };

        let mut state = self.inner.data_store_state.lock();
        if *state == DataStoreState::NotReady {
            info!(state = ?resolved, "Data store access resolved");
            *state = resolved;
        }
        *state
    }

    /// Number of sessions currently active in this process
    pub fn active_session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    /// Active session for `key` in the store scope `scope`, if any
    pub(crate) fn active_session(&self, scope: &str, key: &str) -> Option<Profile> {
        match self
            .inner
            .sessions
            .lock()
            .get(&(scope.to_string(), key.to_string()))
        {
            Some(Slot::Active(profile)) => Some(profile.clone()),
            _ => None,
        }
    }

    pub(crate) fn gateway(&self, store_name: &str, backend: Arc<dyn KeyValueBackend>) -> StoreGateway {
        StoreGateway::new(
            store_name,
            backend,
            self.inner.config.retry.clone(),
            Arc::clone(&self.inner.monitor),
            self.inner.on_error.clone(),
        )
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub(crate) fn report_overwrite(&self, store_name: &str, key: &str, issues: Vec<String>) {
        warn!(
            store = store_name,
            key,
            issues = ?issues,
            "Stored profile failed validation, salvaged what was usable"
        );
        self.inner.on_overwrite.fire(&OverwriteEvent {
            store_name: store_name.to_string(),
            key: key.to_string(),
            issues,
        });
    }

    /// Claim the registry slot for `key` before acquisition starts
    pub(crate) fn reserve_session(&self, scope: &str, key: &str) -> Result<()> {
        let mut sessions = self.inner.sessions.lock();
        let slot_key = (scope.to_string(), key.to_string());
        if sessions.contains_key(&slot_key) {
            return Err(ProfileStoreError::InvalidOperation(format!(
                "a session for key '{}' in store '{}' is already active in this process",
                key, scope
            )));
        }
        sessions.insert(slot_key, Slot::Acquiring);
        Ok(())
    }

    pub(crate) fn activate_session(&self, scope: &str, key: &str, profile: Profile) {
        self.inner
            .sessions
            .lock()
            .insert((scope.to_string(), key.to_string()), Slot::Active(profile));
    }

    /// Free the slot for `key`. An active slot is only freed by the profile
    /// that holds it.
    pub(crate) fn release_session(&self, scope: &str, key: &str, profile: Option<&Profile>) {
        let mut sessions = self.inner.sessions.lock();
        let slot_key = (scope.to_string(), key.to_string());
        let matches = match (sessions.get(&slot_key), profile) {
            (Some(Slot::Acquiring), None) => true,
            (Some(Slot::Active(held)), Some(profile)) => held.ptr_eq(profile),
            _ => false,
        };
        if matches {
            sessions.remove(&slot_key);
        }
    }

    /// Begin shutdown: refuse new sessions and end every active one with a
    /// final save. Returns once all of them have finished.
    pub async fn close(&self) {
        let was_closing = self.inner.closing.send_replace(true);
        if !was_closing {
            info!(instance = %self.inner.marker, "Profile runtime closing");
            self.inner.on_closing.fire(&true);
        }

        let profiles: Vec<Profile> = self
            .inner
            .sessions
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(profile) => Some(profile.clone()),
                Slot::Acquiring => None,
            })
            .collect();

        futures::future::join_all(
            profiles
                .iter()
                .map(|profile| profile.end_with_reason(LastSaveReason::Shutdown)),
        )
        .await;

        info!(
            instance = %self.inner.marker,
            ended = profiles.len(),
            "All sessions released"
        );
    }
}
