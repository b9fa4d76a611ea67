//! # clusterlimit
//!
//! A cluster-wide concurrency limiter: one global budget of `N` permits,
//! shared by many process-local limiters through a singleton coordinator.
//!
//! Two tiers:
//!
//! - [`coordinator::Coordinator`] is the single cluster-wide authority on the
//!   permit pool: it owns `availablePermits` and charges/credits it against
//!   each registered client, purging clients it hasn't heard from in a
//!   configured timeout.
//! - [`client::ClientLimiter`] is what a process actually acquires and
//!   releases permits through. It keeps a small local cache replenished and
//!   drained against the coordinator by a single background reconciler task,
//!   so that most acquisitions never leave the process.
//!
//! The RPCs between the two tiers ([`transport::CoordinatorApi`] /
//! [`transport::ClientCallback`]) are deliberately left as traits rather than
//! wired to any particular network transport or service-discovery layer —
//! that boundary is a host concern. [`coordinator::Coordinator`] itself
//! implements `CoordinatorApi` directly for in-process use, which doubles as
//! this crate's own reference implementation and test harness.
//!
//! ## Features
//!
//! - A strict global cap on concurrently held permits, enforced cluster-wide
//! - A bounded, FIFO local wait queue per client, with cancellation support
//! - Idempotent retries: at-least-once delivery to the coordinator never
//!   double-charges a client
//! - Idle-client reclamation, so a crashed or partitioned client's permits
//!   are eventually returned to the pool without an explicit unregister
//! - Statistics tracking per client

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod client;
pub mod coordinator;
pub mod core;
pub mod identity;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientLimiter, ClientLimiterConfig};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorSnapshot};
pub use core::{ClientError, CoordinatorError, MetadataName, RateLimitLease, RateLimiter, RateLimiterStatistics};
pub use identity::ClientHandle;
pub use transport::{ClientCallback, CoordinatorApi};
