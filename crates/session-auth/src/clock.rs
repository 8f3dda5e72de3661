//! Wall-clock abstraction used for expiry checks

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" for token expiry evaluation and refresh scheduling.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Seconds since the unix epoch, fractional.
    fn unix_secs(&self) -> f64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
