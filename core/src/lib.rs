//! # Hive Shim Core
//!
//! Core traits and types for the Hive request/response shim.
//!
//! Frontend resources issue what looks like a synchronous call
//! (`send(request) -> response`) while the actual transport is an asynchronous,
//! partitioned publish/subscribe broker with backend workers producing
//! responses on a shared topic. This crate holds the pieces every other crate
//! in the workspace agrees on:
//!
//! - **Envelope**: the wire unit, tagged with a correlation id
//! - **Broker seam**: publisher, consumer and consumer-factory traits
//! - **Scheduler seam**: injectable timers for caller-scoped timeouts
//! - **Environment**: injectable clock
//! - **Errors**: the caller-facing error taxonomy
//!
//! ## Data Flow
//!
//! ```text
//! caller → RpcClient → registry.register(id) → publish envelope → [broker]
//!        → N × consumer worker.poll() → registry.offer_response(envelope)
//!        → completes the caller's pending handle
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Broker seam traits
pub mod broker;

/// Message envelope and correlation ids
pub mod envelope;

/// Caller-facing errors
pub mod error;

/// Injectable scheduling
pub mod scheduler;

pub use broker::{BrokerConsumer, BrokerError, ConsumerFactory, Delivery, RequestPublisher};
pub use envelope::{CorrelationId, Envelope, EnvelopeKind, RemoteError};
pub use error::RpcError;
pub use scheduler::{ScheduledTask, Scheduler, TimerHandle};

/// Environment module - Dependency injection traits
///
/// External dependencies that affect determinism are abstracted behind
/// traits and injected where they are used.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    ///
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
