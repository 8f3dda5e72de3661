//! Idle timeout countdown
//!
//! A single re-armable countdown: every qualifying activity event calls
//! `touch()`, which restarts it. When it runs out the `on_idle` callback is
//! invoked once (typically to log the user out).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::timer::TimerSlot;

type IdleCallback = Arc<dyn Fn() + Send + Sync>;

pub struct IdleTimeout {
    timeout: Duration,
    on_idle: IdleCallback,
    timer: TimerSlot,
}

impl IdleTimeout {
    pub fn new(timeout: Duration, on_idle: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            timeout,
            on_idle: Arc::new(on_idle),
            timer: TimerSlot::new("idle-timeout"),
        }
    }

    /// Start (or restart) the countdown.
    pub fn start(&self) {
        self.touch();
    }

    /// Record user activity: restart the countdown from zero.
    pub fn touch(&self) {
        let on_idle = self.on_idle.clone();
        let timeout = self.timeout;
        self.timer.arm(timeout, async move {
            info!(idle_secs = timeout.as_secs(), "idle timeout reached");
            on_idle();
        });
    }

    /// Stop counting down without invoking the callback.
    pub fn stop(&self) {
        self.timer.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_armed()
    }
}
