//! Auto-save task of an active session
//!
//! One task per session. It wakes on a periodic tick, on `save()` calls,
//! on internal nudges such as message acks, and on notifications addressed
//! to the session's key. It stops when the session leaves the active state.
//! Periodic ticks only write when something changed or the heartbeat is due,
//! nudges only when something changed. `save()` always writes, and a burst
//! of calls made before the write starts produces one write.

use crate::{
    notifier::{Notification, NotificationKind},
    profile::Profile,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Periodic,
    Requested,
    Forced,
    Notified(NotificationKind),
}

/// Next notification for `key`, pending forever once the channel closes
async fn next_notification(
    rx: &mut Option<broadcast::Receiver<Notification>>,
    scope: &str,
    key: &str,
) -> NotificationKind {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(notification) if notification.concerns(scope, key) => return notification.kind,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                // One of the dropped notifications may have been ours
                debug!(key, skipped, "Notification receiver lagged");
                return NotificationKind::MessageQueued;
            }
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

/// Start the auto-save task for an active session profile
pub(crate) fn spawn(profile: Profile) -> JoinHandle<()> {
    let runtime = profile.store().runtime().clone();
    let config = runtime.config();
    let period = config.auto_save_tick();
    let mut notifications = Some(runtime.notifier().subscribe());

    tokio::spawn(async move {
        let scope = profile.store().scope().to_string();
        let key = profile.key().to_string();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                _ = profile.inner.stop.notified() => break,
                _ = interval.tick() => Trigger::Periodic,
                _ = profile.inner.save_requested.notified() => Trigger::Requested,
                _ = profile.inner.force_save.notified() => Trigger::Forced,
                kind = next_notification(&mut notifications, &scope, &key) => Trigger::Notified(kind),
            };
            if !profile.is_active() {
                break;
            }
            tick(&profile, trigger).await;
        }

        debug!(store = %scope, key = %key, "Auto-save stopped");
    })
}

async fn tick(profile: &Profile, trigger: Trigger) {
    let due = match trigger {
        Trigger::Periodic => profile.is_dirty() || profile.heartbeat_due(),
        Trigger::Requested => profile.is_dirty(),
        Trigger::Forced => true,
        // The stored document changed under us
        Trigger::Notified(_) => true,
    };
    if !due {
        return;
    }

    if let Err(e) = profile.persist().await {
        warn!(
            store = profile.store().name(),
            key = profile.key(),
            trigger = ?trigger,
            error = %e,
            "Auto-save failed, retrying on the next tick"
        );
    }
}
