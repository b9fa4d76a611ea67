//! Metadata name constants for rate limit leases.

/// Common metadata names used in rate limit leases.
pub struct MetadataName;

impl MetadataName {
    /// Human-readable reason a lease was not acquired (e.g. `"Queue limit reached"`).
    ///
    /// Type: `String`
    pub const FAILURE_REASON: &'static str = "FailureReason";
}
