//! Epoch-millisecond clock driven by the async runtime's timer.
//!
//! Records persist wall-clock epoch milliseconds, while waiting is done with
//! `tokio::time`. Anchoring the epoch to a runtime `Instant` keeps both views
//! consistent, including under a paused test runtime where virtual time
//! advances without the system clock moving.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_epoch_ms: i64,
    anchor: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(system_epoch_ms())
    }

    /// A clock whose current reading is `epoch_ms`.
    pub fn starting_at(epoch_ms: i64) -> Self {
        Self {
            anchor_epoch_ms: epoch_ms,
            anchor: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        let elapsed = self.anchor.elapsed().as_millis() as i64;
        self.anchor_epoch_ms.saturating_add(elapsed)
    }
}

pub fn system_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
