//! # profile-store - Session-Locked Profile Persistence
//!
//! **Crash-safe single-writer sessions over compare-and-swap key-value stores.**
//! Many server processes share one remote store; this crate guarantees that
//! at any moment at most one of them considers itself the owner of a given
//! profile key, that owners keep their data saved, and that a crashed owner
//! never locks a key forever.
//!
//! ## Overview
//!
//! The only primitive required from the store is an atomic per-key
//! read-modify-write ([`KeyValueBackend::update`]). There is no lock
//! service: the lock is a record inside the stored document, and every
//! state change is a compare-and-swap on it.
//!
//! - **Sessions** - [`ProfileStore::start_session`] claims a key, polling
//!   while a live owner holds it, or stealing it after a grace period
//! - **Auto-save** - active sessions write periodically; each write is also
//!   the heartbeat that keeps the lock alive
//! - **Crash recovery** - a lock whose heartbeat is older than
//!   `ASSUME_DEAD` can be claimed by anyone
//! - **Messaging** - [`ProfileStore::message`] queues data for a key;
//!   handlers on the owning process acknowledge it
//! - **History** - snapshots of current and past versions via
//!   [`ProfileStore::get`] and [`ProfileStore::version_query`]
//! - **Health** - a critical-state flag that trips when store calls keep
//!   failing
//!
//! ## Core Concepts
//!
//! ### 1. Runtime
//!
//! A [`ProfileRuntime`] is the context of one server process: its session
//! marker, configuration, backend, notifier and the registry of sessions it
//! holds. Calling [`ProfileRuntime::close`] ends every session with a final
//! save.
//!
//! ### 2. Documents
//!
//! Every key stores one [`Document`]: the user payload, [`DocumentMetadata`]
//! carrying the lock and heartbeat, a message queue and a list of user ids.
//! Decoding is lenient; malformed components are salvaged and reported via
//! [`ProfileRuntime::on_overwrite`].
//!
//! ### 3. Sessions
//!
//! Session profiles follow the state machine in [`session`]. Ownership loss
//! is detected on the next write and reported through
//! [`Profile::on_session_end`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use profile_store::{ProfileRuntime, SessionStart, StartSessionOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> profile_store::Result<()> {
//!     let runtime = ProfileRuntime::builder().owner_id("place-1").build()?;
//!     let players = runtime.store("players", json!({"coins": 0, "items": []}));
//!
//!     if let SessionStart::Started(profile) = players
//!         .start_session("player-42", StartSessionOptions::new())
//!         .await?
//!     {
//!         profile.reconcile();
//!         profile.data()["coins"] = json!(100);
//!         profile.save_now().await?;
//!         profile.end_session().await;
//!     }
//!
//!     runtime.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Timing constants live in [`ProfileStoreConfig`]. Defaults suit
//! production; every value can be overridden through
//! `PROFILE_STORE_<NAME>` environment variables or
//! [`ProfileStoreConfig::set_constant`].

pub mod backend;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod messages;
pub mod monitor;
pub mod notifier;
pub mod profile;
pub mod reconcile;
pub mod retry;
pub mod runtime;
mod scheduler;
pub mod session;
pub mod signal;
pub mod store;
pub mod version;

// Re-export main types
pub use backend::{
    KeyInfo, KeyValueBackend, SortDirection, StoredValue, UpdateFn, UpdateResult, VersionInfo,
    VersionListRequest, VersionPage,
};
pub use clock::Clock;
pub use config::{ConstantName, ProfileStoreConfig};
pub use document::{Document, DocumentMetadata, QueuedMessage, ReleaseRequest, SessionMarker};
pub use error::{ErrorClass, ProfileStoreError, Result};
pub use gateway::StoreErrorEvent;
pub use memory::{FailureKind, InMemoryBackend};
pub use messages::MessageAck;
pub use monitor::CriticalStateMonitor;
pub use notifier::{LocalNotifier, NoopNotifier, Notification, NotificationKind, Notifier};
pub use profile::{DataAccess, LastSaveReason, Profile, ProfileKind};
pub use reconcile::reconcile;
pub use retry::RetryConfig;
pub use runtime::{DataStoreState, OverwriteEvent, ProfileRuntime, ProfileRuntimeBuilder};
pub use session::{SessionState, StartSessionOptions};
pub use signal::{Connection, Signal};
pub use store::{ProfileStore, SessionStart};
pub use version::VersionQuery;
