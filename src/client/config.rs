//! Client limiter configuration.

use crate::core::ClientError;
use std::time::Duration;

/// Immutable configuration for a [`super::ClientLimiter`].
#[derive(Clone, Debug)]
pub struct ClientLimiterConfig {
    /// The cluster-wide cap (`N`), needed locally only to validate that a
    /// single request never asks for more than the whole pool could ever
    /// grant.
    pub global_permit_count: u32,

    /// Desired size of the local permit cache (`T`). `1 ≤ T ≤ N`.
    pub target_permits_per_client: u32,

    /// Max sum of outstanding waiter permits (`Q`). `≥ 0`.
    pub queue_limit: u32,

    /// Heartbeat period (`R`). Must be strictly positive; spec additionally
    /// requires `R < I` against the coordinator's idle timeout, but since the
    /// two configs are constructed independently for two different
    /// processes in this crate's API, that cross-tier constraint is a
    /// deployment-time responsibility rather than something this
    /// constructor can check — see DESIGN.md.
    pub lease_refresh_interval: Duration,
}

impl ClientLimiterConfig {
    /// Create a new configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `global_permit_count == 0`,
    /// `target_permits_per_client` is not in `[1, global_permit_count]`, or
    /// `lease_refresh_interval` is zero.
    pub fn new(
        global_permit_count: u32,
        target_permits_per_client: u32,
        queue_limit: u32,
        lease_refresh_interval: Duration,
    ) -> Result<Self, ClientError> {
        if global_permit_count == 0 {
            return Err(ClientError::InvalidArgument(
                "global_permit_count must be greater than 0".to_string(),
            ));
        }
        if target_permits_per_client == 0 || target_permits_per_client > global_permit_count {
            return Err(ClientError::InvalidArgument(format!(
                "target_permits_per_client must be in [1, {global_permit_count}]"
            )));
        }
        if lease_refresh_interval.is_zero() {
            return Err(ClientError::InvalidArgument(
                "lease_refresh_interval must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            global_permit_count,
            target_permits_per_client,
            queue_limit,
            lease_refresh_interval,
        })
    }
}
