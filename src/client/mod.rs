//! The process-local client tier: a small cache of permits drawn from the
//! cluster-wide pool, kept in sync by a single background reconciler task.

mod config;
mod limiter;
mod reconciler;

pub use config::ClientLimiterConfig;
pub use limiter::ClientLimiter;
