//! Coordinator configuration.

use crate::core::CoordinatorError;
use std::time::Duration;

/// Immutable configuration for a [`super::Coordinator`].
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Cluster-wide cap on concurrently held permits (`N`). Must be ≥ 1.
    pub global_permit_count: u32,

    /// How long a client may go unseen before the idle-purge timer reclaims
    /// its charged permits (`I`). Must be > 0.
    pub idle_client_timeout: Duration,

    /// How often the idle-purge timer scans `clients`. Spec fixes this at 5s;
    /// exposed here so tests can drive it faster without changing the purge
    /// *threshold* (`idle_client_timeout`).
    pub idle_purge_interval: Duration,
}

impl CoordinatorConfig {
    /// Create a new configuration with the spec-mandated 5 second purge scan
    /// interval.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `global_permit_count == 0` or
    /// `idle_client_timeout` is zero.
    pub fn new(
        global_permit_count: u32,
        idle_client_timeout: Duration,
    ) -> Result<Self, CoordinatorError> {
        Self::with_purge_interval(global_permit_count, idle_client_timeout, Duration::from_secs(5))
    }

    /// Create a new configuration with an explicit purge scan interval
    /// (primarily for tests that want idle reclamation to happen quickly).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `global_permit_count == 0`,
    /// `idle_client_timeout` is zero, or `idle_purge_interval` is zero.
    pub fn with_purge_interval(
        global_permit_count: u32,
        idle_client_timeout: Duration,
        idle_purge_interval: Duration,
    ) -> Result<Self, CoordinatorError> {
        if global_permit_count == 0 {
            return Err(CoordinatorError::InvalidArgument(
                "global_permit_count must be greater than 0".to_string(),
            ));
        }
        if idle_client_timeout.is_zero() {
            return Err(CoordinatorError::InvalidArgument(
                "idle_client_timeout must be greater than zero".to_string(),
            ));
        }
        if idle_purge_interval.is_zero() {
            return Err(CoordinatorError::InvalidArgument(
                "idle_purge_interval must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            global_permit_count,
            idle_client_timeout,
            idle_purge_interval,
        })
    }
}
