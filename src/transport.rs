//! The opaque boundary between a client limiter and the coordinator.
//!
//! The cluster membership / actor-placement runtime that would carry these
//! calls across process boundaries in production is explicitly out of
//! scope. What this crate owns is the *protocol* on both sides of that
//! boundary, so it defines the boundary as a pair of traits rather than
//! committing to any particular RPC framework:
//!
//! - [`CoordinatorApi`]: the four client → coordinator RPCs.
//! - [`ClientCallback`]: the one coordinator → client callback.
//!
//! [`crate::coordinator::Coordinator`] implements `CoordinatorApi` directly
//! for in-process use (no serialization) — this both serves as the
//! reference implementation and is all this crate's own tests need, since
//! the actual network transport is a host concern.

use crate::core::CoordinatorError;
use crate::identity::ClientHandle;
use async_trait::async_trait;

/// The coordinator's RPC surface, as seen by a client.
///
/// A `ClientLimiter` is generic over `Arc<dyn CoordinatorApi>`; anything
/// implementing this trait — whether in-process or backed by a real RPC
/// client stub — can serve as its coordinator.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// `TryAcquire(client, seq, permits) -> granted`.
    ///
    /// Idempotent on `(client, seq)`: replaying the highest-observed `seq`
    /// for a client returns that call's original grant without further
    /// mutation.
    async fn try_acquire(
        &self,
        client: ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<u32, CoordinatorError>;

    /// `Release(client, seq, permits)`.
    ///
    /// Idempotent on `(client, seq)` like `try_acquire`.
    async fn release(
        &self,
        client: ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<(), CoordinatorError>;

    /// `RefreshLease(client)` — a heartbeat; touches `lastSeen` only.
    async fn refresh_lease(&self, client: ClientHandle);

    /// `Unregister(client)` — best-effort; returns the client's charged
    /// permits to the global pool immediately rather than waiting for idle
    /// purge.
    async fn unregister(&self, client: ClientHandle);
}

/// The coordinator → client callback surface.
///
/// Coordinator state stores this behind a `Weak` handle (see
/// [`crate::identity::ClientHandle`]): a callback failing because the
/// client process is gone is swallowed, never surfaced as an error.
pub trait ClientCallback: Send + Sync {
    /// `OnPermitsAvailable(approxAvailable)` — advisory wake-up. The client
    /// does not receive a grant here; it must re-issue `TryAcquire`.
    fn on_permits_available(&self, approx_available: u32);
}
