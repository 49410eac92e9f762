//! Named profile stores
//!
//! A [`ProfileStore`] binds a name and a payload template to the runtime's
//! backend. Every operation on keys starts here: sessions, one-off reads,
//! version history, messaging and removal.

use crate::{
    backend::SortDirection,
    document::{self, Document, QueuedMessage},
    error::{ProfileStoreError, Result},
    gateway::StoreGateway,
    memory::InMemoryBackend,
    notifier::{Notification, NotificationKind},
    profile::{LastSaveReason, Profile},
    runtime::ProfileRuntime,
    scheduler,
    session::{self, AcquireContext, Acquisition, StartSessionOptions},
    version::VersionQuery,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of [`ProfileStore::start_session`]
#[derive(Debug)]
pub enum SessionStart {
    Started(Profile),
    /// The key stayed locked by a live owner for the whole timeout
    TimedOut,
    /// The cancel predicate returned true
    Cancelled,
    /// The runtime began closing
    Closing,
}

impl SessionStart {
    pub fn is_started(&self) -> bool {
        matches!(self, SessionStart::Started(_))
    }

    pub fn profile(self) -> Option<Profile> {
        match self {
            SessionStart::Started(profile) => Some(profile),
            _ => None,
        }
    }
}

struct StoreInner {
    runtime: ProfileRuntime,
    name: String,
    /// Registry and notification namespace; differs from `name` for mocks
    scope: String,
    template: Value,
    gateway: StoreGateway,
    mock_backend: Arc<InMemoryBackend>,
    is_mock: bool,
}

/// Handle to a named store. Cheap to clone.
#[derive(Clone)]
pub struct ProfileStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore")
            .field("name", &self.inner.name)
            .field("is_mock", &self.inner.is_mock)
            .finish()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ProfileStoreError::InvalidOperation(
            "profile key must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl ProfileStore {
    pub(crate) fn new(runtime: ProfileRuntime, name: String, template: Value) -> Self {
        let gateway = runtime.gateway(&name, Arc::clone(&runtime.inner.backend));
        let mock_backend = Arc::new(InMemoryBackend::with_clock(runtime.clock()));
        Self {
            inner: Arc::new(StoreInner {
                runtime,
                scope: name.clone(),
                name,
                template,
                gateway,
                mock_backend,
                is_mock: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Payload given to keys that hold nothing yet
    pub fn template(&self) -> &Value {
        &self.inner.template
    }

    pub fn is_mock(&self) -> bool {
        self.inner.is_mock
    }

    pub fn runtime(&self) -> &ProfileRuntime {
        &self.inner.runtime
    }

    pub(crate) fn scope(&self) -> &str {
        &self.inner.scope
    }

    pub(crate) fn gateway(&self) -> &StoreGateway {
        &self.inner.gateway
    }

    /// Same store over an isolated in-memory backend. Every call returns a
    /// handle to the same mock data.
    pub fn mock(&self) -> ProfileStore {
        if self.inner.is_mock {
            return self.clone();
        }
        let backend = Arc::clone(&self.inner.mock_backend);
        Self {
            inner: Arc::new(StoreInner {
                runtime: self.inner.runtime.clone(),
                name: self.inner.name.clone(),
                scope: format!("{}#mock", self.inner.name),
                template: self.inner.template.clone(),
                gateway: self.inner.gateway.with_backend(backend.clone()),
                mock_backend: backend,
                is_mock: true,
            }),
        }
    }

    /// Acquire the session lock on `key` and load its profile.
    ///
    /// Polls while another live process owns the key. With
    /// [`StartSessionOptions::steal`] the owner is asked to release and the
    /// lock is taken by force once the steal grace has passed.
    pub async fn start_session(&self, key: &str, options: StartSessionOptions) -> Result<SessionStart> {
        validate_key(key)?;
        let runtime = &self.inner.runtime;
        if runtime.is_closing() {
            return Ok(SessionStart::Closing);
        }
        runtime.reserve_session(self.scope(), key)?;

        let closing_runtime = runtime.clone();
        let is_closing = move || closing_runtime.is_closing();
        let ctx = AcquireContext {
            gateway: &self.inner.gateway,
            config: runtime.config(),
            clock: runtime.clock(),
            marker: runtime.marker(),
            key,
            template: &self.inner.template,
            notifier: runtime.notifier(),
            notify_scope: self.scope(),
            is_closing: &is_closing,
        };

        debug!(store = self.name(), key, steal = options.steal, "Starting session");
        let claimed = match session::acquire(&ctx, &options).await {
            Ok(Acquisition::Claimed(claimed)) => claimed,
            Ok(other) => {
                runtime.release_session(self.scope(), key, None);
                return Ok(match other {
                    Acquisition::TimedOut => SessionStart::TimedOut,
                    Acquisition::Cancelled => SessionStart::Cancelled,
                    Acquisition::Closing | Acquisition::Claimed(_) => SessionStart::Closing,
                });
            }
            Err(e) => {
                runtime.release_session(self.scope(), key, None);
                return Err(e);
            }
        };

        if !claimed.issues.is_empty() {
            runtime.report_overwrite(self.name(), key, claimed.issues.clone());
        }

        let profile = Profile::from_claim(self.clone(), key.to_string(), claimed);
        runtime.activate_session(self.scope(), key, profile.clone());
        info!(
            store = self.name(),
            key,
            session_load_count = profile.session_load_count(),
            "Session started"
        );

        if runtime.is_closing() {
            profile.end_with_reason(LastSaveReason::Shutdown).await;
            return Ok(SessionStart::Closing);
        }

        scheduler::spawn(profile.clone());
        profile.deliver_messages();
        Ok(SessionStart::Started(profile))
    }

    /// Append `message` to the queue of `key`, creating the profile if it
    /// does not exist. The owner, if any, is woken: directly when it runs
    /// in this process, through the notifier otherwise.
    pub async fn message(&self, key: &str, message: Value) -> Result<Uuid> {
        validate_key(key)?;
        let runtime = &self.inner.runtime;
        let now = runtime.clock().now();
        let max_queue = runtime.config().max_message_queue;
        let template = &self.inner.template;
        let queued = QueuedMessage::new(message, now);
        let id = queued.id;

        let mut evicted = 0;
        let mut owner_active = false;
        let mut issues = Vec::new();
        let mut transform = |current: Option<&Value>| -> Option<Value> {
            let mut doc = match current {
                Some(value) => {
                    let decoded = document::decode(value, template, now);
                    issues = decoded.issues;
                    decoded.document
                }
                None => Document::new(template.clone(), now),
            };
            evicted = doc.push_message(queued.clone(), max_queue);
            owner_active = doc.metadata.active_session.is_some();
            document::encode(&doc).ok()
        };

        let result = self
            .inner
            .gateway
            .compare_and_swap(key, &mut transform)
            .await?;
        if !result.is_written() {
            return Err(ProfileStoreError::Permanent(format!(
                "message for key '{}' could not be encoded",
                key
            )));
        }
        if !issues.is_empty() {
            runtime.report_overwrite(self.name(), key, issues);
        }
        if evicted > 0 {
            warn!(store = self.name(), key, evicted, "Message queue full, dropped oldest messages");
        }

        if let Some(local) = runtime.active_session(self.scope(), key) {
            // Owner lives in this process; its next write picks the message up
            local.inner.force_save.notify_one();
        } else if owner_active {
            let notification = Notification::new(self.scope(), key, NotificationKind::MessageQueued);
            if let Err(e) = runtime.notifier().publish(notification).await {
                debug!(key, error = %e, "Message notification not delivered");
            }
        }
        Ok(id)
    }

    /// Read-only snapshot of `key`, or of one historical `version` of it
    pub async fn get(&self, key: &str, version: Option<&str>) -> Result<Option<Profile>> {
        validate_key(key)?;
        let stored = match version {
            Some(version) => self.inner.gateway.get_version(key, version).await?,
            None => self.inner.gateway.read(key).await?,
        };
        Ok(stored.map(|stored| self.snapshot(key, stored.value, Some(stored.key_info))))
    }

    pub(crate) fn snapshot(
        &self,
        key: &str,
        value: Value,
        key_info: Option<crate::backend::KeyInfo>,
    ) -> Profile {
        let now = self.inner.runtime.clock().now();
        let decoded = document::decode(&value, &self.inner.template, now);
        if decoded.is_corrupt() {
            self.inner
                .runtime
                .report_overwrite(self.name(), key, decoded.issues.clone());
        }
        Profile::snapshot(self.clone(), key.to_string(), decoded.document, key_info)
    }

    /// Iterate over historical versions of `key` within an optional time range
    pub fn version_query(
        &self,
        key: &str,
        direction: SortDirection,
        min_date: Option<DateTime<Utc>>,
        max_date: Option<DateTime<Utc>>,
    ) -> VersionQuery {
        VersionQuery::new(self.clone(), key.to_string(), direction, min_date, max_date)
    }

    /// Delete `key` and its history. Returns whether anything was stored.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let removed = self.inner.gateway.remove(key).await?;
        info!(store = self.name(), key, removed, "Profile removed");
        Ok(removed)
    }
}
