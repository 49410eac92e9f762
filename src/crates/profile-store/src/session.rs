//! Session lock protocol
//!
//! A session is a lease on one key, recorded inside the document itself as
//! `metadata.activeSession` and kept alive by the owner's writes
//! (`metadata.lastUpdate`). There is no lock service: every transition is a
//! compare-and-swap on the document, and lost races are noticed on the next
//! read.
//!
//! ```text
//!            ┌──────────┐  claim   ┌────────┐  end_session  ┌────────┐  final save  ┌───────┐
//!  Idle ───▶ │Acquiring │ ───────▶ │ Active │ ────────────▶ │ Ending │ ───────────▶ │ Ended │
//!            └──────────┘          └────────┘               └────────┘              └───────┘
//!                 │ timeout / error     │ ownership lost         │ ownership lost
//!                 ▼                     ▼                        ▼
//!              Failed                 Stolen                   Stolen
//! ```
//!
//! Acquisition ([`acquire`]) reads the document and decides ([`decide`]):
//!
//! - no owner, our own stale marker, or an owner whose heartbeat is older
//!   than `ASSUME_DEAD`: claim it, bumping `sessionLoadCount`;
//! - live owner, no steal: poll again after `FIRST_LOAD_REPEAT`, then every
//!   `LOAD_REPEAT_PERIOD`, until `START_SESSION_TIMEOUT`;
//! - live owner, steal: write a release request the owner can observe, and
//!   force-claim once the request is `SESSION_STEAL` old.

use crate::{
    backend::KeyInfo,
    clock::Clock,
    config::ProfileStoreConfig,
    document::{self, Document, DocumentMetadata, ReleaseRequest, SessionMarker},
    error::{ProfileStoreError, Result},
    gateway::StoreGateway,
    notifier::{Notification, NotificationKind, Notifier},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    Active,
    Ending,
    Ended,
    /// Another process took the lock
    Stolen,
    /// Acquisition did not succeed
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Ended | SessionState::Stolen | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Acquiring => "Acquiring",
            SessionState::Active => "Active",
            SessionState::Ending => "Ending",
            SessionState::Ended => "Ended",
            SessionState::Stolen => "Stolen",
            SessionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// In-memory lease held by one profile handle
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub marker: SessionMarker,
    pub state: SessionState,
    pub last_heartbeat_write: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<String>, marker: SessionMarker, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            marker,
            state: SessionState::Idle,
            last_heartbeat_write: now,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not have
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        use SessionState::*;
        let allowed = matches!(
            (self.state, next),
            (Idle, Acquiring)
                | (Acquiring, Active)
                | (Acquiring, Failed)
                | (Active, Ending)
                | (Active, Stolen)
                | (Ending, Ended)
                | (Ending, Stolen)
        );
        if !allowed {
            return Err(ProfileStoreError::InvalidOperation(format!(
                "invalid session transition from {} to {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Predicate checked before every acquisition poll; `true` aborts
pub type CancelFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Options for starting a session
#[derive(Clone, Default)]
pub struct StartSessionOptions {
    /// Ask the current owner to release, then force-claim after the steal grace
    pub steal: bool,
    /// Abort acquisition when this returns true
    pub cancel: Option<CancelFn>,
    /// Overrides `START_SESSION_TIMEOUT` for this call
    pub timeout: Option<Duration>,
}

impl StartSessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steal(mut self, steal: bool) -> Self {
        self.steal = steal;
        self
    }

    pub fn cancel<F>(mut self, cancel: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.cancel = Some(Arc::new(cancel));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |cancel| cancel())
    }
}

impl fmt::Debug for StartSessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartSessionOptions")
            .field("steal", &self.steal)
            .field("cancel", &self.cancel.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// What an acquisition attempt should do with the observed document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    Claim,
    RequestRelease,
    Wait,
}

/// Decide how to treat the lease recorded in `metadata`.
///
/// Pure function of the document and the current time.
pub fn decide(
    metadata: &DocumentMetadata,
    me: &SessionMarker,
    steal: bool,
    now: DateTime<Utc>,
    config: &ProfileStoreConfig,
) -> ClaimDecision {
    let Some(lease) = metadata.lease() else {
        return ClaimDecision::Claim;
    };

    if lease.owner == me || !lease.is_alive(now, config.assume_dead) {
        return ClaimDecision::Claim;
    }

    if !steal {
        return ClaimDecision::Wait;
    }

    let Some(request) = &metadata.release_request else {
        return ClaimDecision::RequestRelease;
    };
    let waited = (now - request.requested_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if &request.requested_by == me {
        return if waited >= config.session_steal {
            ClaimDecision::Claim
        } else {
            ClaimDecision::RequestRelease
        };
    }

    // Another stealer's request stands until one poll past its grace
    let abandoned_after = config.session_steal.saturating_add(config.load_repeat_period);
    if waited >= abandoned_after {
        ClaimDecision::RequestRelease
    } else {
        ClaimDecision::Wait
    }
}

/// Successful claim
#[derive(Debug, Clone)]
pub struct Claimed {
    pub document: Document,
    pub key_info: KeyInfo,
    /// Shape problems found in the stored value before the claim
    pub issues: Vec<String>,
}

/// Outcome of [`acquire`]
#[derive(Debug)]
pub enum Acquisition {
    Claimed(Claimed),
    TimedOut,
    Cancelled,
    Closing,
}

/// Everything acquisition needs from its store and runtime
pub struct AcquireContext<'a> {
    pub gateway: &'a StoreGateway,
    pub config: &'a ProfileStoreConfig,
    pub clock: Clock,
    pub marker: &'a SessionMarker,
    pub key: &'a str,
    pub template: &'a Value,
    pub notifier: &'a Arc<dyn Notifier>,
    pub notify_scope: &'a str,
    pub is_closing: &'a (dyn Fn() -> bool + Send + Sync),
}

enum Attempt {
    Claimed(Claimed),
    Pending,
}

/// Run the acquisition protocol until the lock is ours, the timeout
/// elapses, the caller cancels or the process starts closing.
pub async fn acquire(ctx: &AcquireContext<'_>, options: &StartSessionOptions) -> Result<Acquisition> {
    let started = Instant::now();
    let timeout = options.timeout.unwrap_or(ctx.config.start_session_timeout);
    let mut first_poll = true;

    loop {
        if (ctx.is_closing)() {
            return Ok(Acquisition::Closing);
        }
        if options.is_cancelled() {
            debug!(key = ctx.key, "Session acquisition cancelled");
            return Ok(Acquisition::Cancelled);
        }

        match attempt(ctx, options.steal).await {
            Ok(Attempt::Claimed(claimed)) => return Ok(Acquisition::Claimed(claimed)),
            Ok(Attempt::Pending) => {}
            Err(e) if e.is_transient() => {
                warn!(
                    store = ctx.gateway.store_name(),
                    key = ctx.key,
                    error = %e,
                    "Store unavailable during session acquisition, polling again"
                );
            }
            Err(e) => return Err(e),
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            info!(
                store = ctx.gateway.store_name(),
                key = ctx.key,
                timeout_ms = timeout.as_millis() as u64,
                "Session acquisition timed out"
            );
            return Ok(Acquisition::TimedOut);
        }

        let period = if first_poll {
            ctx.config.first_load_repeat
        } else {
            ctx.config.load_repeat_period
        };
        first_poll = false;
        tokio::time::sleep(period.min(timeout - elapsed)).await;
    }
}

/// One compare-and-swap round of the acquisition protocol
async fn attempt(ctx: &AcquireContext<'_>, steal: bool) -> Result<Attempt> {
    let now = ctx.clock.now();
    let mut decision = ClaimDecision::Wait;
    let mut issues = Vec::new();

    let mut transform = |current: Option<&Value>| -> Option<Value> {
        let (mut doc, found_issues) = match current {
            Some(value) => {
                let decoded = document::decode(value, ctx.template, now);
                (decoded.document, decoded.issues)
            }
            None => (Document::new(ctx.template.clone(), now), Vec::new()),
        };
        issues = found_issues;
        decision = decide(&doc.metadata, ctx.marker, steal, now, ctx.config);

        match decision {
            ClaimDecision::Claim => {
                doc.metadata.active_session = Some(ctx.marker.clone());
                doc.metadata.release_request = None;
                doc.metadata.session_load_count += 1;
                doc.metadata.last_update = now;
            }
            ClaimDecision::RequestRelease => {
                let already_requested = doc
                    .metadata
                    .release_request
                    .as_ref()
                    .map_or(false, |request| &request.requested_by == ctx.marker);
                if already_requested {
                    return None;
                }
                doc.metadata.release_request = Some(ReleaseRequest {
                    requested_by: ctx.marker.clone(),
                    requested_at: now,
                });
            }
            ClaimDecision::Wait => return None,
        }

        document::encode(&doc).ok()
    };

    let result = ctx.gateway.compare_and_swap(ctx.key, &mut transform).await?;

    match decision {
        ClaimDecision::Claim => {
            let stored = match result.into_stored() {
                Some(stored) => stored,
                None => {
                    return Err(ProfileStoreError::Permanent(
                        "store accepted a claim but returned no value".to_string(),
                    ))
                }
            };
            let decoded = document::decode(&stored.value, ctx.template, now);
            // The value we just wrote must name us; anything else is a backend bug
            if decoded.document.metadata.active_session.as_ref() != Some(ctx.marker) {
                return Err(ProfileStoreError::CorruptDocument {
                    key: ctx.key.to_string(),
                    reason: "claimed document does not carry our session marker".to_string(),
                });
            }
            Ok(Attempt::Claimed(Claimed {
                document: decoded.document,
                key_info: stored.key_info,
                issues,
            }))
        }
        ClaimDecision::RequestRelease => {
            if result.is_written() {
                debug!(key = ctx.key, "Release requested from current owner");
                let notification = Notification::new(
                    ctx.notify_scope,
                    ctx.key,
                    NotificationKind::ReleaseRequested,
                );
                if let Err(e) = ctx.notifier.publish(notification).await {
                    debug!(key = ctx.key, error = %e, "Release notification not delivered");
                }
            }
            Ok(Attempt::Pending)
        }
        ClaimDecision::Wait => Ok(Attempt::Pending),
    }
}
