//! Single-slot one-shot timer
//!
//! Holds at most one pending timer. Arming replaces (and aborts) whatever
//! was pending, so re-arming is idempotent. Used for the proactive token
//! refresh and for the idle countdown.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An instance-owned optional timer handle.
#[derive(Debug)]
pub struct TimerSlot {
    name: &'static str,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Mutex::new(None),
        }
    }

    /// Run `task` after `delay`, cancelling any previously armed timer.
    ///
    /// When the delay elapses the task is spawned as its own tokio task, so
    /// a later `arm` or `cancel` (including one made by the task itself)
    /// never aborts work that has already started.
    ///
    /// Returns false when called outside a tokio runtime or when the deadline
    /// is not representable; nothing is armed and any pending timer is kept.
    pub fn arm<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(timer = self.name, "no tokio runtime, timer not armed");
                return false;
            }
        };

        let Some(deadline) = tokio::time::Instant::now().checked_add(delay) else {
            warn!(
                timer = self.name,
                delay_secs = delay.as_secs(),
                "deadline out of range, timer not armed"
            );
            return false;
        };

        let name = self.name;
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!(timer = name, "timer fired");
            tokio::spawn(task);
        });

        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
        }
        debug!(timer = self.name, delay_ms = delay.as_millis() as u64, "timer armed");
        true
    }

    /// Cancel the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                if was_pending {
                    debug!(timer = self.name, "timer cancelled");
                }
                was_pending
            }
            None => false,
        }
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().take() {
            handle.abort();
        }
    }
}
