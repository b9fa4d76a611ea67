//! Error types for the two tiers of the cluster concurrency limiter.
//!
//! The client and coordinator fail in genuinely different ways, so they get
//! separate error enums rather than one shared grab-bag type.

use thiserror::Error;

/// Errors surfaced to the host by a [`crate::client::ClientLimiter`].
///
/// Per the propagation policy, a not-acquired lease (queue full, shutdown) is
/// *not* an error here — only conditions the host must react to differently
/// than "didn't get the permits" are.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The request was cancelled via its cancellation token while queued.
    /// Distinct from a not-acquired lease: cancellation short-circuits the
    /// whole call rather than resolving it with a lease to dispose.
    #[error("request was cancelled")]
    Cancelled,

    /// `permit_count` was negative, or exceeded the global permit count `N`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors returned by the coordinator's RPC surface ([`crate::transport::CoordinatorApi`]).
///
/// Per spec, everything other than a malformed call (negative or over-`N`
/// argument) is absorbed and logged inside the coordinator rather than
/// surfaced as an `Err` — a client bug is the only thing the caller needs to
/// know about synchronously.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// `permits` was negative or exceeded the configured `GlobalPermitCount`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The call never reached the coordinator, or its response never made it
    /// back. A reconciler seeing this must retry with the *same* `seq` —
    /// never advance past a call that may not have landed.
    #[error("transport error: {0}")]
    Transport(String),
}
