//! Best-effort cross-process wake-up channel
//!
//! Owners of active sessions listen for notifications about their keys and
//! react immediately instead of waiting for the next auto-save tick. Nothing
//! depends on delivery: a lost notification only delays the reaction until
//! the owner's next heartbeat write.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What happened to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Another process asked the owner to end its session
    ReleaseRequested,
    /// A message was appended to the key's queue
    MessageQueued,
}

/// Wake-up addressed to whoever owns `key` in store `store_name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub store_name: String,
    pub key: String,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(store_name: impl Into<String>, key: impl Into<String>, kind: NotificationKind) -> Self {
        Self {
            store_name: store_name.into(),
            key: key.into(),
            kind,
        }
    }

    pub fn concerns(&self, store_name: &str, key: &str) -> bool {
        self.store_name == store_name && self.key == key
    }
}

/// Messaging side-channel between processes
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a notification to every subscribed process
    async fn publish(&self, notification: Notification) -> Result<()>;

    /// Receive notifications published after this call
    fn subscribe(&self) -> broadcast::Receiver<Notification>;
}

/// Notifier for processes sharing one address space (tests, simulations)
#[derive(Debug, Clone)]
pub struct LocalNotifier {
    tx: broadcast::Sender<Notification>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LocalNotifier {
    async fn publish(&self, notification: Notification) -> Result<()> {
        // Nobody listening is not an error
        let _ = self.tx.send(notification);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

/// Notifier that drops everything; sessions fall back to polling
#[derive(Debug, Clone)]
pub struct NoopNotifier {
    tx: broadcast::Sender<Notification>,
}

impl NoopNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self { tx }
    }
}

impl Default for NoopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for NoopNotifier {
    async fn publish(&self, _notification: Notification) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_notifier_delivers() {
        let notifier = LocalNotifier::new();
        let mut rx = notifier.subscribe();

        notifier
            .publish(Notification::new("players", "p1", NotificationKind::MessageQueued))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert!(received.concerns("players", "p1"));
        assert!(!received.concerns("players", "p2"));
        assert_eq!(received.kind, NotificationKind::MessageQueued);
    }

    #[tokio::test]
    async fn test_noop_notifier_is_silent() {
        let notifier = NoopNotifier::new();
        let mut rx = notifier.subscribe();
        notifier
            .publish(Notification::new("s", "k", NotificationKind::ReleaseRequested))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
