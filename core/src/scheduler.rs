//! Injectable scheduling for caller-scoped timers.
//!
//! Call timeouts are owned by the request dispatcher. Instead of reaching for a
//! process-wide timer pool, the dispatcher asks an injected [`Scheduler`] to run
//! a task after a delay and keeps the returned [`TimerHandle`]. Dropping or
//! cancelling the handle disarms the timer.
//!
//! Production code uses the tokio-backed scheduler from `hive-shim-runtime`;
//! tests use the manual scheduler from `hive-shim-testing`, which only fires
//! tasks when time is advanced explicitly.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A task run once by a [`Scheduler`].
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed, unless the returned handle is
    /// cancelled or dropped first.
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle;
}

/// Cancellation handle for a scheduled task.
///
/// The timer is disarmed when the handle is dropped.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Wrap the token a scheduler watches for cancellation.
    #[must_use]
    pub const fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Disarm the timer.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the timer has been disarmed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
