//! Pool health.
//!
//! A pool is judged on two things only: whether it is running, and how many
//! of its workers are subscribed and polling. [`HealthReport`] folds the
//! pools of a process into one status.

use crate::listener::LifecycleState;
use std::fmt;

/// Health status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Running with every worker active
    Healthy,
    /// Running with some workers lost
    Degraded,
    /// Not running, or running without a single active worker
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time health of one consumer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    /// Pool name
    pub pool: &'static str,
    /// Lifecycle state when sampled
    pub state: LifecycleState,
    /// Workers subscribed and polling
    pub active_workers: usize,
    /// Workers the pool was configured with
    pub worker_count: usize,
    /// Status derived from the fields above
    pub status: HealthStatus,
}

impl PoolHealth {
    /// Judge a pool from its state and worker counts.
    #[must_use]
    pub fn assess(
        pool: &'static str,
        state: LifecycleState,
        active_workers: usize,
        worker_count: usize,
    ) -> Self {
        let status = if state != LifecycleState::Running || active_workers == 0 {
            HealthStatus::Unhealthy
        } else if active_workers < worker_count {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            pool,
            state,
            active_workers,
            worker_count,
            status,
        }
    }
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({}, {} of {} workers active)",
            self.pool, self.status, self.state, self.active_workers, self.worker_count
        )
    }
}

/// Health of every pool in the process.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status among the pools; healthy when there are none
    pub status: HealthStatus,
    /// Per-pool health
    pub pools: Vec<PoolHealth>,
}

impl HealthReport {
    /// Fold pool health into one report.
    #[must_use]
    pub fn new(pools: Vec<PoolHealth>) -> Self {
        let status = pools
            .iter()
            .map(|pool| pool.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { status, pools }
    }

    /// Whether every pool is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
