//! # Hive Shim Testing
//!
//! Testing utilities for the Hive request/response shim.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: partitioned broker with consumer groups and fault
//!   injection, implementing the core broker seam
//! - [`ManualScheduler`]: timers that only fire when a test advances time
//! - [`FixedClock`] and [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use hive_shim_testing::{InMemoryBroker, ManualScheduler};
//!
//! #[tokio::test]
//! async fn times_out_without_backend() {
//!     let broker = InMemoryBroker::new();
//!     let scheduler = Arc::new(ManualScheduler::new());
//!     let client = RpcClient::new(matcher, Arc::new(broker), scheduler.clone(), "request_topic");
//!
//!     let call = tokio::spawn(async move { client.send("ping", vec![], Duration::from_secs(1)).await });
//!     scheduler.advance(Duration::from_secs(1));
//!
//!     assert!(matches!(call.await.unwrap(), Err(RpcError::Timeout { .. })));
//! }
//! ```

use chrono::{DateTime, Utc};
use hive_shim_core::environment::Clock;

/// In-memory broker
pub mod broker;

/// Mock implementations of Environment traits
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
    #![allow(clippy::missing_panics_doc)]

    use super::{Clock, DateTime, Utc};
    use hive_shim_core::{ScheduledTask, Scheduler, TimerHandle};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use hive_shim_testing::mocks::FixedClock;
    /// use hive_shim_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Clock starting at 2025-01-01 00:00:00 UTC.
        #[must_use]
        pub fn new() -> Self {
            Self::starting_at(epoch())
        }

        /// Clock starting at `time`.
        #[must_use]
        pub const fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap();
            *time += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    struct Timer {
        due: Duration,
        seq: u64,
        token: CancellationToken,
        task: ScheduledTask,
    }

    #[derive(Default)]
    struct Timeline {
        now: Duration,
        next_seq: u64,
        timers: Vec<Timer>,
    }

    /// Scheduler whose tasks fire only on [`advance`](Self::advance).
    ///
    /// Tasks run on the thread calling `advance`, in due-time order, ties
    /// broken by scheduling order.
    #[derive(Default)]
    pub struct ManualScheduler {
        timeline: Mutex<Timeline>,
    }

    impl ManualScheduler {
        /// Scheduler at virtual time zero.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Move virtual time forward and run every task now due.
        ///
        /// Returns the number of tasks run.
        pub fn advance(&self, by: Duration) -> usize {
            let due = {
                let mut timeline = self.timeline.lock().unwrap();
                timeline.now += by;
                let now = timeline.now;
                let (mut due, pending): (Vec<Timer>, Vec<Timer>) = timeline
                    .timers
                    .drain(..)
                    .filter(|timer| !timer.token.is_cancelled())
                    .partition(|timer| timer.due <= now);
                timeline.timers = pending;
                due.sort_by_key(|timer| (timer.due, timer.seq));
                due
            };

            // Run outside the lock; tasks may schedule more work.
            let mut ran = 0;
            for timer in due {
                if !timer.token.is_cancelled() {
                    (timer.task)();
                    ran += 1;
                }
            }
            ran
        }

        /// Armed, not yet fired timers.
        #[must_use]
        pub fn pending(&self) -> usize {
            self.timeline
                .lock()
                .unwrap()
                .timers
                .iter()
                .filter(|timer| !timer.token.is_cancelled())
                .count()
        }

        /// Current virtual time.
        #[must_use]
        pub fn elapsed(&self) -> Duration {
            self.timeline.lock().unwrap().now
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
            let token = CancellationToken::new();
            let mut timeline = self.timeline.lock().unwrap();
            let seq = timeline.next_seq;
            timeline.next_seq += 1;
            let due = timeline.now + delay;
            timeline.timers.push(Timer {
                due,
                seq,
                token: token.clone(),
                task,
            });
            TimerHandle::new(token)
        }
    }
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, InMemoryConsumer, InMemoryConsumerFactory};
pub use mocks::{FixedClock, ManualClock, ManualScheduler, test_clock};
