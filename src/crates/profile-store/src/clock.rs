//! Wall-clock source for ownership heartbeats and document timestamps

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of wall-clock time.
///
/// Cross-process decisions (heartbeat age, steal grace) compare timestamps
/// stored in documents, so they need wall time rather than a monotonic
/// instant. `Clock::tokio()` derives wall time from the tokio clock, which
/// makes paused-time tests deterministic; every simulated process in a test
/// must share the same clock value.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    /// `Utc::now()`
    System,
    /// Wall time anchored at creation and advanced by the tokio clock
    Tokio {
        origin: DateTime<Utc>,
        started: Instant,
    },
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn tokio() -> Self {
        Clock::Tokio {
            origin: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Tokio { origin, started } => {
                let elapsed = chrono::Duration::from_std(started.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                *origin + elapsed
            }
        }
    }

    /// Time elapsed since `earlier`, zero if `earlier` lies in the future
    pub fn since(&self, earlier: DateTime<Utc>) -> std::time::Duration {
        (self.now() - earlier)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}
