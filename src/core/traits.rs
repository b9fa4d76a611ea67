//! Core rate limiter trait, implemented by [`crate::client::ClientLimiter`].

use crate::core::{ClientError, RateLimitLease, RateLimiterStatistics};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host-facing rate limiter interface.
///
/// This is the host → client boundary from the spec: `attempt_acquire` is
/// `AttemptAcquire`, `acquire_async` is `AcquireAsync`, and
/// `get_statistics().current_available_permits` / `idle_duration()` are
/// `AvailablePermits()` / `IdleDuration()`. Implementations must be
/// thread-safe (`Send + Sync`).
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Attempt to acquire permits synchronously (non-blocking).
    ///
    /// Returns immediately with either a successful or failed lease. Never
    /// queues: a request that can't be satisfied from the local cache right
    /// now fails rather than waiting.
    ///
    /// A disposed limiter is not a distinct error case: it simply never has
    /// anything to hand out, so calling this after shutdown returns a
    /// not-acquired lease like any other unsatisfiable request.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` - `permit_count` is negative or exceeds the global permit count
    fn attempt_acquire(&self, permit_count: u32) -> Result<RateLimitLease, ClientError>;

    /// Acquire permits asynchronously, with optional cancellation.
    ///
    /// If permits are not immediately available, the request is queued (up to
    /// the configured queue limit) and completed when permits become
    /// available locally.
    ///
    /// # Errors
    ///
    /// * `Cancelled` - `cancel_token` fired before the request was fulfilled
    /// * `InvalidArgument` - `permit_count` is negative or exceeds the global permit count
    async fn acquire_async(
        &self,
        permit_count: u32,
        cancel_token: Option<CancellationToken>,
    ) -> Result<RateLimitLease, ClientError>;

    /// Get a snapshot of the current limiter statistics.
    ///
    /// `current_available_permits` is the local cache only — advisory, not
    /// the cluster-wide figure.
    fn get_statistics(&self) -> RateLimiterStatistics;

    /// Duration since the limiter last had zero permits in use and zero
    /// queued waiters. `None` while either condition doesn't hold.
    fn idle_duration(&self) -> Option<Duration>;
}
