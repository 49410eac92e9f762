//! Store health tracking ("critical state")
//!
//! A hysteresis filter over store call outcomes. Errors that arrive within
//! `CRITICAL_STATE_ERROR_EXPIRE` of the previous one are chained; once the
//! chain reaches `CRITICAL_STATE_ERROR_COUNT` the process enters critical
//! state. It leaves it on the next successful call, or after
//! `CRITICAL_STATE_EXPIRE` without new errors. The monitor only informs;
//! it never blocks calls.

use crate::config::ProfileStoreConfig;
use crate::signal::Signal;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct MonitorState {
    consecutive_errors: u32,
    error_window_start: Option<Instant>,
    last_error: Option<Instant>,
    is_critical: bool,
    watcher_running: bool,
}

/// Process-wide store health flag
#[derive(Debug)]
pub struct CriticalStateMonitor {
    error_count: u32,
    error_expire: Duration,
    expire: Duration,
    state: Mutex<MonitorState>,
    flag: watch::Sender<bool>,
    on_toggle: Signal<bool>,
}

impl CriticalStateMonitor {
    pub fn new(config: &ProfileStoreConfig) -> Arc<Self> {
        let (flag, _rx) = watch::channel(false);
        Arc::new(Self {
            error_count: config.critical_state_error_count,
            error_expire: config.critical_state_error_expire,
            expire: config.critical_state_expire,
            state: Mutex::new(MonitorState::default()),
            flag,
            on_toggle: Signal::new(),
        })
    }

    /// Whether the store is currently considered unhealthy
    pub fn is_critical(&self) -> bool {
        self.refresh();
        self.state.lock().is_critical
    }

    /// Number of chained errors in the current window
    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    /// Start of the current error chain
    pub fn error_window_start(&self) -> Option<Instant> {
        self.state.lock().error_window_start
    }

    /// Fired with the new value whenever the flag changes
    pub fn on_toggle(&self) -> &Signal<bool> {
        &self.on_toggle
    }

    /// Watch the flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    /// Record one failed store call
    pub fn record_error(self: &Arc<Self>) {
        let now = Instant::now();
        let (entered, spawn_watcher) = {
            let mut state = self.state.lock();

            let chained = state
                .last_error
                .map_or(false, |last| now.duration_since(last) <= self.error_expire);
            if chained {
                state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            } else {
                state.consecutive_errors = 1;
                state.error_window_start = Some(now);
            }
            state.last_error = Some(now);

            let entered = !state.is_critical && state.consecutive_errors >= self.error_count;
            if entered {
                state.is_critical = true;
            }
            let spawn_watcher = state.is_critical && !state.watcher_running;
            if spawn_watcher {
                state.watcher_running = true;
            }
            (entered, spawn_watcher)
        };

        if entered {
            warn!(
                errors = self.error_count,
                "Store entered critical state"
            );
            self.publish(true);
        }
        if spawn_watcher {
            self.spawn_expiry_watcher();
        }
    }

    /// Record one successful store call
    pub fn record_success(&self) {
        let cleared = {
            let mut state = self.state.lock();
            state.consecutive_errors = 0;
            state.error_window_start = None;
            std::mem::replace(&mut state.is_critical, false)
        };

        if cleared {
            info!("Store left critical state after a successful call");
            self.publish(false);
        }
    }

    /// Clear the flag if the cooldown elapsed. Returns whether it is still set.
    fn refresh(&self) -> bool {
        let cleared = {
            let mut state = self.state.lock();
            let quiet = state
                .last_error
                .map_or(true, |last| last.elapsed() >= self.expire);
            if state.is_critical && quiet {
                state.is_critical = false;
                true
            } else {
                false
            }
        };

        if cleared {
            info!("Store left critical state after a quiet period");
            self.publish(false);
        }
        self.state.lock().is_critical
    }

    fn publish(&self, value: bool) {
        self.flag.send_replace(value);
        self.on_toggle.fire(&value);
    }

    /// Clears the flag on time even when nobody polls it
    fn spawn_expiry_watcher(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Without a runtime the flag still clears lazily in `is_critical`
            self.state.lock().watcher_running = false;
            return;
        };

        let monitor: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            loop {
                let remaining = {
                    let Some(monitor) = monitor.upgrade() else { return };
                    let mut state = monitor.state.lock();
                    match (state.is_critical, state.last_error) {
                        (true, Some(last)) => monitor.expire.saturating_sub(last.elapsed()),
                        _ => {
                            state.watcher_running = false;
                            return;
                        }
                    }
                };

                tokio::time::sleep(remaining).await;

                let Some(monitor) = monitor.upgrade() else { return };
                if !monitor.refresh() {
                    monitor.state.lock().watcher_running = false;
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor(count: u32, error_expire: u64, expire: u64) -> Arc<CriticalStateMonitor> {
        CriticalStateMonitor::new(
            &ProfileStoreConfig::default()
                .with_critical_state_error_count(count)
                .with_critical_state_error_expire(Duration::from_secs(error_expire))
                .with_critical_state_expire(Duration::from_secs(expire)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flips_exactly_at_threshold() {
        let monitor = monitor(3, 10, 60);

        monitor.record_error();
        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.record_error();
        assert!(!monitor.is_critical());

        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.record_error();
        assert!(monitor.is_critical());
        assert_eq!(monitor.consecutive_errors(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_errors_do_not_chain() {
        let monitor = monitor(3, 10, 60);

        for _ in 0..5 {
            monitor.record_error();
            tokio::time::advance(Duration::from_secs(11)).await;
        }

        assert!(!monitor.is_critical());
        assert_eq!(monitor.consecutive_errors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_immediately() {
        let monitor = monitor(2, 10, 60);
        let toggles = Arc::new(AtomicUsize::new(0));
        let counter = toggles.clone();
        monitor.on_toggle().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.record_error();
        monitor.record_error();
        assert!(monitor.is_critical());

        monitor.record_success();
        assert!(!monitor.is_critical());
        assert_eq!(toggles.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clears_after_quiet_period() {
        let monitor = monitor(2, 10, 60);
        let mut flag = monitor.subscribe();

        monitor.record_error();
        monitor.record_error();
        assert!(*flag.borrow_and_update());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(monitor.is_critical());

        // The watcher clears the flag without anyone polling
        flag.changed().await.unwrap();
        assert!(!*flag.borrow());
        assert!(!monitor.is_critical());
    }
}
