//! Observable notifications with synchronous listeners
//!
//! A [`Signal`] keeps an ordered list of listeners invoked synchronously,
//! in connection order, every time the signal fires. Listeners run on the
//! firing task before the surrounding operation continues, which is what
//! lets `on_save` listeners mutate profile data right before it is written.
//! Async code can instead await the next firing with [`Signal::wait`].

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<T>,
}

/// Ordered, append-only set of listeners for one kind of event
pub struct Signal<T> {
    inner: Arc<Registry<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            inner: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                tx,
            }),
        }
    }

    /// Register a listener. It stays connected until the returned
    /// [`Connection`] is disconnected; dropping the connection does not
    /// disconnect.
    pub fn connect<F>(&self, listener: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let registry: Arc<dyn Disconnect> = self.inner.clone();
        Connection {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Whether a firing would reach anyone, listener or waiter
    pub fn is_observed(&self) -> bool {
        self.listener_count() > 0 || self.inner.tx.receiver_count() > 0
    }

    /// Invoke every listener in connection order, then wake waiters.
    pub fn fire(&self, value: &T) {
        // Snapshot so listeners may connect or disconnect while firing
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(value);
        }

        // No receivers is fine
        let _ = self.inner.tx.send(value.clone());
    }

    /// Wait for the next firing
    pub async fn wait(&self) -> T {
        let mut rx = self.inner.tx.subscribe();
        loop {
            match rx.recv().await {
                Ok(value) => return value,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                // The sender lives in `self`, so it cannot close while we wait
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }

    /// Receiver for every future firing
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.inner.tx.subscribe()
    }
}

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

trait Disconnect: Send + Sync {
    fn disconnect(&self, id: u64) -> bool;
}

impl<T: Send> Disconnect for Registry<T> {
    fn disconnect(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }
}

/// Handle for a connected listener
pub struct Connection {
    id: u64,
    registry: Weak<dyn Disconnect>,
}

impl Connection {
    /// Remove the listener. Returns false if it was already removed.
    pub fn disconnect(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.disconnect(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_fire_in_order() {
        let signal: Signal<u32> = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        signal.connect(move |v| first.lock().push(("first", *v)));
        let second = seen.clone();
        signal.connect(move |v| second.lock().push(("second", *v)));

        signal.fire(&7);

        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
        assert_eq!(signal.listener_count(), 2);
    }

    #[test]
    fn test_disconnect() {
        let signal: Signal<()> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let connection = signal.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signal.fire(&());
        assert!(connection.disconnect());
        assert!(!connection.disconnect());
        signal.fire(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_receives_next_firing() {
        let signal: Signal<String> = Signal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::task::yield_now().await;
        signal.fire(&"critical".to_string());

        assert_eq!(waiter.await.unwrap(), "critical");
    }
}
