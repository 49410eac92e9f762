//! Profile handles
//!
//! A [`Profile`] is either a *session profile*, returned by
//! [`ProfileStore::start_session`](crate::ProfileStore::start_session) while
//! this process holds the key's lock, or a *snapshot*, a read-only view
//! returned by `get` and version queries that can only be written back with
//! [`Profile::overwrite`].
//!
//! Session writes go through one compare-and-swap per save. Each write
//! checks that the stored document still names this process as owner,
//! copies the local payload, user ids and tags over the stored ones,
//! refreshes the heartbeat and merges message acknowledgements. A write that
//! finds another owner ends the session as stolen without writing.

use crate::{
    backend::KeyInfo,
    document::{self, Document, DocumentMetadata, QueuedMessage, SessionMarker},
    error::{ProfileStoreError, Result},
    messages::{MessageAck, MessageProcessor},
    reconcile,
    session::{Claimed, Session, SessionState},
    signal::Signal,
    store::ProfileStore,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Why a session is ending gracefully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSaveReason {
    /// `end_session` was called
    Manual,
    /// Another process asked for the key
    External,
    /// The runtime is closing
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Session,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Ordinary save, keeps the lock
    Save,
    /// Final save, clears the lock
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Saved { release_requested: bool },
    /// The stored document no longer names us
    Lost,
    /// The session is not in a state that writes
    Inactive,
}

enum Observed {
    Missing,
    Lost,
    Written { release_requested: bool },
    Unencodable(String),
}

enum EndStart {
    Begin,
    AlreadyEnding,
    Nothing,
}

struct ProfileMeta {
    /// Present on session profiles
    session: Option<Session>,
    /// Owner recorded when a snapshot was read
    observed_owner: Option<SessionMarker>,
    key_info: Option<KeyInfo>,
    /// Last stored metadata, with local edits to `extra_tags`
    metadata: DocumentMetadata,
    user_ids: Vec<i64>,
    saved_user_ids: Vec<i64>,
    saved_extra_tags: Map<String, Value>,
}

struct ProfileSignals {
    on_save: Signal<()>,
    on_last_save: Signal<LastSaveReason>,
    on_session_end: Signal<()>,
    on_after_save: Signal<Value>,
    on_accessed: Signal<DataAccess>,
}

/// A top-level payload key read through [`Profile::get`]
#[derive(Debug, Clone, PartialEq)]
pub struct DataAccess {
    /// Payload at the time of the read
    pub data: Value,
    pub key: String,
}

pub(crate) struct ProfileInner {
    store: ProfileStore,
    key: String,
    kind: ProfileKind,
    data: Mutex<Value>,
    last_saved: Mutex<Value>,
    meta: Mutex<ProfileMeta>,
    pub(crate) messages: MessageProcessor,
    write_gate: tokio::sync::Mutex<()>,
    /// Nudge that writes only when something changed
    pub(crate) save_requested: Arc<Notify>,
    /// Caller `save()`, always writes
    pub(crate) force_save: Notify,
    pub(crate) stop: Notify,
    finished: watch::Sender<bool>,
    signals: ProfileSignals,
}

/// Handle to one profile. Clones share state.
#[derive(Clone)]
pub struct Profile {
    pub(crate) inner: Arc<ProfileInner>,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("store", &self.inner.store.name())
            .field("key", &self.inner.key)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Profile {
    fn build(
        store: ProfileStore,
        key: String,
        kind: ProfileKind,
        document: Document,
        key_info: Option<KeyInfo>,
        session: Option<Session>,
    ) -> Self {
        let save_requested = Arc::new(Notify::new());
        let (finished, _rx) = watch::channel(false);
        let observed_owner = document.metadata.active_session.clone();
        let Document {
            data,
            metadata,
            message_queue,
            user_ids,
        } = document;

        let messages = MessageProcessor::new(Arc::clone(&save_requested));
        let generation = match &session {
            Some(session) => format!(
                "{}:{}",
                session.marker.instance_id, metadata.session_load_count
            ),
            None => "snapshot".to_string(),
        };
        messages.start_generation(generation, message_queue);

        Self {
            inner: Arc::new(ProfileInner {
                store,
                key,
                kind,
                last_saved: Mutex::new(data.clone()),
                data: Mutex::new(data),
                meta: Mutex::new(ProfileMeta {
                    session,
                    observed_owner,
                    key_info,
                    saved_extra_tags: metadata.extra_tags.clone(),
                    metadata,
                    saved_user_ids: user_ids.clone(),
                    user_ids,
                }),
                messages,
                write_gate: tokio::sync::Mutex::new(()),
                save_requested,
                force_save: Notify::new(),
                stop: Notify::new(),
                finished,
                signals: ProfileSignals {
                    on_save: Signal::new(),
                    on_last_save: Signal::new(),
                    on_session_end: Signal::new(),
                    on_after_save: Signal::new(),
                    on_accessed: Signal::new(),
                },
            }),
        }
    }

    pub(crate) fn from_claim(store: ProfileStore, key: String, claimed: Claimed) -> Self {
        let runtime = store.runtime();
        let mut session = Session::new(key.clone(), runtime.marker().clone(), runtime.clock().now());
        session.state = SessionState::Active;
        Self::build(
            store,
            key,
            ProfileKind::Session,
            claimed.document,
            Some(claimed.key_info),
            Some(session),
        )
    }

    pub(crate) fn snapshot(
        store: ProfileStore,
        key: String,
        document: Document,
        key_info: Option<KeyInfo>,
    ) -> Self {
        Self::build(store, key, ProfileKind::Snapshot, document, key_info, None)
    }

    pub(crate) fn ptr_eq(&self, other: &Profile) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn store(&self) -> &ProfileStore {
        &self.inner.store
    }

    pub fn store_name(&self) -> &str {
        self.inner.store.name()
    }

    pub fn kind(&self) -> ProfileKind {
        self.inner.kind
    }

    /// Mutable access to the payload. Do not hold the guard across an await.
    pub fn data(&self) -> MutexGuard<'_, Value> {
        self.inner.data.lock()
    }

    /// Read one top-level payload key, firing [`Profile::on_accessed`]
    pub fn get(&self, key: &str) -> Option<Value> {
        let signal = &self.inner.signals.on_accessed;
        let (value, access) = {
            let data = self.inner.data.lock();
            let value = data.get(key).cloned();
            let access = signal.is_observed().then(|| DataAccess {
                data: data.clone(),
                key: key.to_string(),
            });
            (value, access)
        };
        // Fired outside the lock so listeners can touch the payload
        if let Some(access) = access {
            signal.fire(&access);
        }
        value
    }

    pub fn set_data(&self, data: Value) {
        *self.inner.data.lock() = data;
    }

    /// Deserialize the payload into `T`
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.inner.data.lock().clone();
        Ok(serde_json::from_value(data)?)
    }

    /// Replace the payload with the serialized form of `value`
    pub fn set_data_from<T: Serialize>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_value(value)?;
        *self.inner.data.lock() = data;
        Ok(())
    }

    /// Payload as of the last successful write or load
    pub fn last_saved_data(&self) -> Value {
        self.inner.last_saved.lock().clone()
    }

    pub fn key_info(&self) -> Option<KeyInfo> {
        self.inner.meta.lock().key_info.clone()
    }

    /// Stored metadata as last observed, with local tag edits applied
    pub fn metadata(&self) -> DocumentMetadata {
        self.inner.meta.lock().metadata.clone()
    }

    /// When the profile was first created in the store
    pub fn first_session_time(&self) -> DateTime<Utc> {
        self.inner.meta.lock().metadata.first_session_time
    }

    pub fn session_load_count(&self) -> u64 {
        self.inner.meta.lock().metadata.session_load_count
    }

    /// Session owning this profile: ours for session profiles, the owner at
    /// read time for snapshots
    pub fn session(&self) -> Option<SessionMarker> {
        let meta = self.inner.meta.lock();
        match &meta.session {
            Some(session) => Some(session.marker.clone()),
            None => meta.observed_owner.clone(),
        }
    }

    pub fn user_ids(&self) -> Vec<i64> {
        self.inner.meta.lock().user_ids.clone()
    }

    pub fn add_user_id(&self, user_id: i64) {
        let mut meta = self.inner.meta.lock();
        if !meta.user_ids.contains(&user_id) {
            meta.user_ids.push(user_id);
        }
    }

    pub fn remove_user_id(&self, user_id: i64) {
        self.inner.meta.lock().user_ids.retain(|id| *id != user_id);
    }

    pub fn extra_tags(&self) -> Map<String, Value> {
        self.inner.meta.lock().metadata.extra_tags.clone()
    }

    pub fn set_extra_tag(&self, name: impl Into<String>, value: Value) {
        self.inner
            .meta
            .lock()
            .metadata
            .extra_tags
            .insert(name.into(), value);
    }

    pub fn remove_extra_tag(&self, name: &str) -> Option<Value> {
        self.inner.meta.lock().metadata.extra_tags.remove(name)
    }

    /// Session state; snapshots are always `Idle`
    pub fn state(&self) -> SessionState {
        self.inner
            .meta
            .lock()
            .session
            .as_ref()
            .map_or(SessionState::Idle, |session| session.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Fill keys missing from the payload with the store template
    pub fn reconcile(&self) {
        let template = self.inner.store.template();
        reconcile::reconcile(&mut self.inner.data.lock(), template);
    }

    /// Fired right before every session write; listeners may edit the payload
    pub fn on_save(&self) -> &Signal<()> {
        &self.inner.signals.on_save
    }

    /// Fired once before the final write of a gracefully ending session
    pub fn on_last_save(&self) -> &Signal<LastSaveReason> {
        &self.inner.signals.on_last_save
    }

    /// Fired once when the session ends, gracefully or not
    pub fn on_session_end(&self) -> &Signal<()> {
        &self.inner.signals.on_session_end
    }

    /// Fired after every successful session write with the saved payload
    pub fn on_after_save(&self) -> &Signal<Value> {
        &self.inner.signals.on_after_save
    }

    pub fn on_accessed(&self) -> &Signal<DataAccess> {
        &self.inner.signals.on_accessed
    }

    /// Register a handler for queued messages. Unacknowledged messages,
    /// including ones queued before registration, are offered to it.
    pub fn message_handler<F>(&self, handler: F)
    where
        F: Fn(&Value, MessageAck) + Send + Sync + 'static,
    {
        self.inner.messages.register(Arc::new(handler));
        self.deliver_messages();
    }

    /// Messages waiting in the queue as last observed
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.inner.messages.queued()
    }

    /// Ask for a write soon, even if nothing changed. Requests made before
    /// the write starts are coalesced into it.
    pub fn save(&self) {
        if self.inner.kind == ProfileKind::Snapshot {
            warn!(key = %self.inner.key, "save() on a snapshot profile is ignored, use overwrite()");
            return;
        }
        self.inner.force_save.notify_one();
    }

    /// Write now and wait for the result
    pub async fn save_now(&self) -> Result<()> {
        if self.inner.kind == ProfileKind::Snapshot {
            return Err(ProfileStoreError::InvalidOperation(
                "snapshot profiles are written with overwrite()".to_string(),
            ));
        }
        self.persist().await
    }

    /// End the session with a final save that releases the lock
    pub async fn end_session(&self) {
        self.end_with_reason(LastSaveReason::Manual).await;
    }

    /// Write a snapshot's payload as the key's current value, replacing
    /// the stored payload and clearing any session lock on it.
    ///
    /// Queued messages in the stored document are kept.
    pub async fn overwrite(&self) -> Result<()> {
        if self.inner.kind != ProfileKind::Snapshot {
            return Err(ProfileStoreError::InvalidOperation(
                "only snapshot profiles can be overwritten".to_string(),
            ));
        }

        let store = &self.inner.store;
        let runtime = store.runtime();
        let now = runtime.clock().now();
        let template = store.template();
        let max_queue = runtime.config().max_message_queue;
        let data = self.inner.data.lock().clone();
        let (user_ids, extra_tags) = {
            let meta = self.inner.meta.lock();
            (meta.user_ids.clone(), meta.metadata.extra_tags.clone())
        };

        let mut encode_error = None;
        let mut transform = |current: Option<&Value>| -> Option<Value> {
            let mut doc = match current {
                Some(value) => document::decode(value, template, now).document,
                None => Document::new(template.clone(), now),
            };
            doc.data = data.clone();
            doc.user_ids = user_ids.clone();
            doc.metadata.extra_tags = extra_tags.clone();
            doc.metadata.active_session = None;
            doc.metadata.release_request = None;
            doc.metadata.last_update = now;
            doc.trim_queue(max_queue);
            match document::encode(&doc) {
                Ok(value) => Some(value),
                Err(e) => {
                    encode_error = Some(e.to_string());
                    None
                }
            }
        };

        let result = store
            .gateway()
            .compare_and_swap(&self.inner.key, &mut transform)
            .await?;
        if let Some(reason) = encode_error {
            return Err(ProfileStoreError::Permanent(reason));
        }
        let stored = result.into_stored().ok_or_else(|| {
            ProfileStoreError::Permanent("store accepted an overwrite but returned no value".to_string())
        })?;
        let decoded = document::decode(&stored.value, template, now).document;

        {
            let mut meta = self.inner.meta.lock();
            meta.key_info = Some(stored.key_info);
            meta.observed_owner = None;
            meta.saved_user_ids = user_ids;
            meta.saved_extra_tags = extra_tags;
            meta.metadata = decoded.metadata;
        }
        *self.inner.last_saved.lock() = data;
        self.inner.messages.committed(decoded.message_queue, &Default::default());

        info!(store = store.name(), key = %self.inner.key, "Profile overwritten");
        Ok(())
    }

    /// Local state differs from what was last written
    pub(crate) fn is_dirty(&self) -> bool {
        if *self.inner.data.lock() != *self.inner.last_saved.lock() {
            return true;
        }
        let meta_dirty = {
            let meta = self.inner.meta.lock();
            meta.user_ids != meta.saved_user_ids
                || meta.metadata.extra_tags != meta.saved_extra_tags
        };
        meta_dirty || self.inner.messages.has_pending()
    }

    /// The stored heartbeat is old enough to need refreshing
    pub(crate) fn heartbeat_due(&self) -> bool {
        let runtime = self.inner.store.runtime();
        let refresh = runtime.config().heartbeat_refresh();
        self.inner
            .meta
            .lock()
            .session
            .as_ref()
            .map_or(false, |session| {
                runtime.clock().since(session.last_heartbeat_write) >= refresh
            })
    }

    pub(crate) fn deliver_messages(&self) {
        if self.is_active() {
            self.inner.messages.deliver();
        }
    }

    /// Save path shared by `save_now` and the auto-save task
    pub(crate) async fn persist(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        self.inner.signals.on_save.fire(&());
        match self.write(WriteMode::Save).await? {
            WriteOutcome::Saved {
                release_requested: true,
            } => {
                info!(
                    store = self.inner.store.name(),
                    key = %self.inner.key,
                    "Another process requested this session, releasing"
                );
                self.end_with_reason(LastSaveReason::External).await;
            }
            WriteOutcome::Saved { .. } => self.deliver_messages(),
            WriteOutcome::Lost | WriteOutcome::Inactive => {}
        }
        Ok(())
    }

    /// End the session gracefully. Concurrent callers wait for the first
    /// one to finish.
    pub(crate) async fn end_with_reason(&self, reason: LastSaveReason) {
        let start = {
            let mut meta = self.inner.meta.lock();
            match meta.session.as_mut() {
                Some(session) if session.state == SessionState::Active => {
                    match session.transition(SessionState::Ending) {
                        Ok(()) => EndStart::Begin,
                        Err(_) => EndStart::Nothing,
                    }
                }
                Some(session) if session.state == SessionState::Ending => EndStart::AlreadyEnding,
                _ => EndStart::Nothing,
            }
        };

        match start {
            EndStart::Begin => {}
            EndStart::AlreadyEnding => {
                let mut finished = self.inner.finished.subscribe();
                let _ = finished.wait_for(|done| *done).await;
                return;
            }
            EndStart::Nothing => return,
        }

        self.inner.stop.notify_one();
        info!(
            store = self.inner.store.name(),
            key = %self.inner.key,
            reason = ?reason,
            "Ending session"
        );
        self.inner.signals.on_last_save.fire(&reason);
        self.inner.signals.on_save.fire(&());

        match self.write(WriteMode::Release).await {
            Ok(WriteOutcome::Saved { .. }) => {
                info!(store = self.inner.store.name(), key = %self.inner.key, "Session released");
                self.finish(SessionState::Ended);
            }
            Ok(WriteOutcome::Lost) => {}
            Ok(WriteOutcome::Inactive) => self.finish(SessionState::Ended),
            Err(e) => {
                error!(
                    store = self.inner.store.name(),
                    key = %self.inner.key,
                    error = %e,
                    "Final save failed, the lock expires once its heartbeat is stale"
                );
                self.finish(SessionState::Ended);
            }
        }
    }

    /// Ownership moved elsewhere
    fn mark_lost(&self) {
        warn!(
            store = self.inner.store.name(),
            key = %self.inner.key,
            "Session lock lost to another process"
        );
        self.finish(SessionState::Stolen);
    }

    /// Move to a terminal state once and tear the session down
    fn finish(&self, state: SessionState) {
        let changed = {
            let mut meta = self.inner.meta.lock();
            match meta.session.as_mut() {
                Some(session) if !session.state.is_terminal() => session.transition(state).is_ok(),
                _ => false,
            }
        };
        if !changed {
            return;
        }

        self.inner.stop.notify_one();
        let store = &self.inner.store;
        store
            .runtime()
            .release_session(store.scope(), &self.inner.key, Some(self));
        self.inner.finished.send_replace(true);
        self.inner.signals.on_session_end.fire(&());
    }

    /// One session write
    pub(crate) async fn write(&self, mode: WriteMode) -> Result<WriteOutcome> {
        let inner = &self.inner;
        let _gate = inner.write_gate.lock().await;

        let required = match mode {
            WriteMode::Save => SessionState::Active,
            WriteMode::Release => SessionState::Ending,
        };
        let (user_ids, extra_tags) = {
            let meta = inner.meta.lock();
            match meta.session.as_ref() {
                Some(session) if session.state == required => {}
                _ => return Ok(WriteOutcome::Inactive),
            }
            (meta.user_ids.clone(), meta.metadata.extra_tags.clone())
        };

        let store = &inner.store;
        let runtime = store.runtime();
        let marker = runtime.marker();
        let template = store.template();
        let now = runtime.clock().now();
        let max_queue = runtime.config().max_message_queue;
        let data = inner.data.lock().clone();
        let pending = inner.messages.pending();

        let mut observed = Observed::Missing;
        let mut transform = |current: Option<&Value>| -> Option<Value> {
            let Some(current) = current else {
                observed = Observed::Missing;
                return None;
            };
            let mut doc = document::decode(current, template, now).document;
            if doc.metadata.active_session.as_ref() != Some(marker) {
                observed = Observed::Lost;
                return None;
            }

            let release_requested = doc
                .metadata
                .release_request
                .as_ref()
                .map_or(false, |request| &request.requested_by != marker);
            doc.data = data.clone();
            doc.user_ids = user_ids.clone();
            doc.metadata.extra_tags = extra_tags.clone();
            doc.metadata.last_update = now;
            pending.apply(&mut doc.message_queue);
            doc.trim_queue(max_queue);
            if mode == WriteMode::Release {
                doc.metadata.active_session = None;
            }

            match document::encode(&doc) {
                Ok(value) => {
                    observed = Observed::Written { release_requested };
                    Some(value)
                }
                Err(e) => {
                    observed = Observed::Unencodable(e.to_string());
                    None
                }
            }
        };

        let result = store
            .gateway()
            .compare_and_swap(&inner.key, &mut transform)
            .await?;

        match observed {
            Observed::Written { release_requested } => {
                let stored = result.into_stored().ok_or_else(|| {
                    ProfileStoreError::Permanent(
                        "store accepted a write but returned no value".to_string(),
                    )
                })?;
                let decoded = document::decode(&stored.value, template, now).document;
                {
                    let mut meta = inner.meta.lock();
                    meta.key_info = Some(stored.key_info);
                    meta.saved_user_ids = user_ids;
                    meta.saved_extra_tags = extra_tags;
                    let local_tags = std::mem::take(&mut meta.metadata.extra_tags);
                    meta.metadata = decoded.metadata;
                    meta.metadata.extra_tags = local_tags;
                    if let Some(session) = meta.session.as_mut() {
                        session.last_heartbeat_write = now;
                    }
                }
                *inner.last_saved.lock() = data.clone();
                inner.messages.committed(decoded.message_queue, &pending);

                debug!(
                    store = store.name(),
                    key = %inner.key,
                    mode = ?mode,
                    "Profile saved"
                );
                inner.signals.on_after_save.fire(&data);
                Ok(WriteOutcome::Saved { release_requested })
            }
            Observed::Missing | Observed::Lost => {
                self.mark_lost();
                Ok(WriteOutcome::Lost)
            }
            Observed::Unencodable(reason) => Err(ProfileStoreError::Permanent(reason)),
        }
    }
}
