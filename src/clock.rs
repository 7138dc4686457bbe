//! Monotonic time with a wall-clock anchor.
//!
//! Control logic (breakers, limiters, guardrail windows) runs on
//! `tokio::time::Instant` so tests can drive it with a paused runtime clock.
//! Audit records need wall-clock timestamps; `Clock` derives them from a
//! single anchor so both advance together.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Wall-clock source anchored to a monotonic instant.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor: Instant,
    anchor_epoch_ms: u64,
}

impl Clock {
    /// Anchor the clock at the current moment.
    pub fn new() -> Self {
        let anchor_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::anchored_at(Instant::now(), anchor_epoch_ms)
    }

    /// Anchor the clock at a fixed epoch time (tests, replay).
    pub fn anchored_at(anchor: Instant, anchor_epoch_ms: u64) -> Self {
        Self {
            anchor,
            anchor_epoch_ms,
        }
    }

    /// Current monotonic instant.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Current wall-clock time in milliseconds since the Unix epoch.
    pub fn epoch_millis(&self) -> u64 {
        self.epoch_millis_at(Instant::now())
    }

    /// Wall-clock time corresponding to `instant`.
    pub fn epoch_millis_at(&self, instant: Instant) -> u64 {
        if instant >= self.anchor {
            self.anchor_epoch_ms + instant.duration_since(self.anchor).as_millis() as u64
        } else {
            self.anchor_epoch_ms
                .saturating_sub(self.anchor.duration_since(instant).as_millis() as u64)
        }
    }

    /// Monotonic instant corresponding to an epoch timestamp.
    pub fn instant_at(&self, epoch_ms: u64) -> Instant {
        if epoch_ms >= self.anchor_epoch_ms {
            self.anchor + std::time::Duration::from_millis(epoch_ms - self.anchor_epoch_ms)
        } else {
            let back = std::time::Duration::from_millis(self.anchor_epoch_ms - epoch_ms);
            self.anchor.checked_sub(back).unwrap_or(self.anchor)
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
