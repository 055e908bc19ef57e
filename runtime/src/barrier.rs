//! Startup barrier for consumer pools.
//!
//! A countdown initialized to the worker count. Each worker counts down once,
//! after its subscription succeeded and before it starts polling. The pool
//! waits on the barrier with a bound before declaring itself ready.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Countdown shared by a pool and its workers.
#[derive(Clone, Debug)]
pub struct StartupBarrier {
    remaining: Arc<watch::Sender<usize>>,
}

impl StartupBarrier {
    /// Create a barrier waiting for `count` workers.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self {
            remaining: Arc::new(remaining),
        }
    }

    /// Signal that one worker is subscribed.
    pub fn count_down(&self) {
        self.remaining.send_modify(|remaining| *remaining = remaining.saturating_sub(1));
    }

    /// Workers that have not signalled yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Wait until every worker signalled or `bound` elapsed.
    ///
    /// Returns `true` if the barrier reached zero within the bound.
    pub async fn wait(&self, bound: Duration) -> bool {
        let mut receiver = self.remaining.subscribe();
        let reached =
            tokio::time::timeout(bound, receiver.wait_for(|remaining| *remaining == 0)).await;
        matches!(reached, Ok(Ok(_)))
    }
}
