//! The background task that keeps a client's local cache in sync with the
//! coordinator: heartbeats, requests more permits when running short, and
//! returns surplus when holding more than its target share.
//!
//! Exactly one of these runs per [`ClientLimiter`] — it is the sole issuer of
//! `TryAcquire`/`Release`/`RefreshLease` calls for that client, so `nextSeq`
//! never needs synchronization beyond the atomic it's stored in.

use crate::client::limiter::ClientLimiter;
use crate::core::CoordinatorError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backoff applied after a transport failure before the next reconciliation
/// attempt. The failing call's `seq` is never advanced, so the retry reuses
/// it and lands idempotently if the original call actually did land.
const TRANSPORT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Drive reconciliation until the limiter is shut down.
///
/// Spawned once by [`ClientLimiter::new`]; exits when `reconciler_cancel` is
/// triggered by `shutdown`/`drop`.
pub(super) async fn run(limiter: Arc<ClientLimiter>) {
    // Force an immediate heartbeat (and reconciliation pass below) on the
    // very first iteration rather than waiting out a full interval first.
    let mut last_heartbeat = Instant::now() - limiter.config.lease_refresh_interval;

    loop {
        if limiter.state.lock().disposed {
            break;
        }

        if last_heartbeat.elapsed() >= limiter.config.lease_refresh_interval {
            let handle = limiter.handle();
            limiter.coordinator.refresh_lease(handle).await;
            last_heartbeat = Instant::now();
        }

        let wait = match tick(&limiter).await {
            Ok(()) => limiter.config.lease_refresh_interval,
            Err(backoff) => backoff,
        };

        tokio::select! {
            biased;
            () = limiter.reconciler_cancel.cancelled() => break,
            () = limiter.notify.notified() => {}
            () = tokio::time::sleep(wait) => {}
        }
    }
}

/// One reconciliation pass: request more permits if short, return surplus if
/// flush. Returns `Err(backoff)` if a transport error means the caller
/// should pause before retrying.
///
/// Exposed at `pub(super)` so tests can drive reconciliation deterministically
/// via [`ClientLimiter::new_without_reconciler`] instead of racing the
/// spawned task.
pub(super) async fn tick(limiter: &Arc<ClientLimiter>) -> Result<(), Duration> {
    let handle = limiter.handle();

    let deficit = compute_deficit(limiter);
    if deficit > 0 {
        let seq = limiter.next_seq.load(Ordering::Relaxed);
        match limiter.coordinator.try_acquire(handle.clone(), seq, deficit).await {
            Ok(granted) => {
                limiter.next_seq.store(seq + 1, Ordering::Relaxed);
                if granted > 0 {
                    limiter.apply_grant(granted);
                }
            }
            Err(CoordinatorError::Transport(msg)) => {
                tracing::warn!(client_id = handle.id(), error = %msg, "try_acquire failed, backing off");
                return Err(TRANSPORT_RETRY_BACKOFF);
            }
            Err(CoordinatorError::InvalidArgument(msg)) => {
                tracing::error!(client_id = handle.id(), error = %msg, "try_acquire rejected as invalid");
            }
        }
    }

    let surplus = reserve_surplus(limiter);
    if surplus > 0 {
        let seq = limiter.next_seq.load(Ordering::Relaxed);
        match limiter.coordinator.release(handle.clone(), seq, surplus).await {
            Ok(()) => {
                limiter.next_seq.store(seq + 1, Ordering::Relaxed);
            }
            Err(CoordinatorError::Transport(msg)) => {
                tracing::warn!(client_id = handle.id(), error = %msg, "surplus release failed, backing off");
                restore_surplus(limiter, surplus);
                return Err(TRANSPORT_RETRY_BACKOFF);
            }
            Err(CoordinatorError::InvalidArgument(msg)) => {
                tracing::error!(client_id = handle.id(), error = %msg, "release rejected as invalid");
                restore_surplus(limiter, surplus);
            }
        }
    }

    Ok(())
}

/// How many more permits this client should ask for right now: enough to
/// reach its target cache size, or enough to satisfy the head of the waiter
/// queue if that single request is larger than the target — whichever is
/// greater — but never more than the global cap.
fn compute_deficit(limiter: &Arc<ClientLimiter>) -> u32 {
    let state = limiter.state.lock();
    let target = limiter.config.target_permits_per_client;

    let mut deficit = target.saturating_sub(state.local_available);
    if let Some(head) = state.waiter_queue.front() {
        if head.count > state.local_available {
            deficit = deficit.max(head.count - state.local_available);
        }
    }

    deficit.min(limiter.config.global_permit_count)
}

/// If the local cache exceeds its target share and no one is waiting on it,
/// reserve the excess (debit it from `local_available` immediately, before
/// the RPC lands) so a concurrent acquire can't claim permits this
/// reconciliation pass is about to hand back to the coordinator.
fn reserve_surplus(limiter: &Arc<ClientLimiter>) -> u32 {
    let mut state = limiter.state.lock();
    if !state.waiter_queue.is_empty() {
        return 0;
    }
    let surplus = state.local_available.saturating_sub(limiter.config.target_permits_per_client);
    state.local_available -= surplus;
    surplus
}

fn restore_surplus(limiter: &Arc<ClientLimiter>, surplus: u32) {
    let mut state = limiter.state.lock();
    state.local_available += surplus;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::config::ClientLimiterConfig;
    use crate::core::RateLimiter;
    use crate::identity::ClientHandle;
    use crate::transport::CoordinatorApi;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    /// A coordinator stand-in whose grant, failure, and call-count behavior
    /// is fully controllable, for exercising reconciler retry/backoff logic
    /// without a real `Coordinator`'s own state machine in the way.
    #[derive(Default)]
    struct MockCoordinator {
        try_acquire_calls: AtomicU32,
        release_calls: AtomicU32,
        grant: AtomicU32,
        fail_try_acquire: AtomicBool,
        fail_release: AtomicBool,
    }

    #[async_trait]
    impl CoordinatorApi for MockCoordinator {
        async fn try_acquire(
            &self,
            _client: ClientHandle,
            _seq: u64,
            _permits: u32,
        ) -> Result<u32, CoordinatorError> {
            self.try_acquire_calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_try_acquire.load(Ordering::Relaxed) {
                return Err(CoordinatorError::Transport("simulated outage".into()));
            }
            Ok(self.grant.load(Ordering::Relaxed))
        }

        async fn release(
            &self,
            _client: ClientHandle,
            _seq: u64,
            _permits: u32,
        ) -> Result<(), CoordinatorError> {
            self.release_calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_release.load(Ordering::Relaxed) {
                return Err(CoordinatorError::Transport("simulated outage".into()));
            }
            Ok(())
        }

        async fn refresh_lease(&self, _client: ClientHandle) {}

        async fn unregister(&self, _client: ClientHandle) {}
    }

    fn config(global: u32, target: u32) -> ClientLimiterConfig {
        ClientLimiterConfig::new(global, target, 50, Duration::from_secs(30)).unwrap()
    }

    #[tokio::test]
    async fn deficit_clamped_to_target_when_no_waiters() {
        let mock = Arc::new(MockCoordinator {
            grant: AtomicU32::new(7),
            ..Default::default()
        });
        let limiter = ClientLimiter::new_without_reconciler(config(100, 7), mock.clone());

        tick(&limiter).await.unwrap();

        assert_eq!(mock.try_acquire_calls.load(Ordering::Relaxed), 1);
        assert_eq!(limiter.get_statistics().current_available_permits, 7);
    }

    #[tokio::test]
    async fn deficit_widens_to_cover_an_oversized_head_waiter() {
        let mock = Arc::new(MockCoordinator {
            grant: AtomicU32::new(20),
            ..Default::default()
        });
        let limiter = ClientLimiter::new_without_reconciler(config(100, 5), mock.clone());

        // Queue a waiter asking for more than target before reconciling.
        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire_async(20, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tick(&limiter).await.unwrap();

        // compute_deficit should have asked for 20 (the waiter's need), not 5
        // (the target), and the grant should have drained straight to it.
        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_acquired());
    }

    #[tokio::test]
    async fn surplus_is_reserved_before_the_release_rpc_and_restored_on_failure() {
        let mock = Arc::new(MockCoordinator {
            fail_release: AtomicBool::new(true),
            ..Default::default()
        });
        let limiter = ClientLimiter::new_without_reconciler(config(100, 5), mock.clone());
        limiter.apply_grant(12); // local_available = 12, target = 5: surplus of 7.

        let backoff = tick(&limiter).await;
        assert!(backoff.is_err(), "transport failure on release must back off");

        // The failed release must have restored the reserved surplus rather
        // than leaking it.
        assert_eq!(limiter.get_statistics().current_available_permits, 12);
        assert_eq!(mock.release_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn successful_surplus_release_does_not_return_the_reservation() {
        let mock = Arc::new(MockCoordinator::default());
        let limiter = ClientLimiter::new_without_reconciler(config(100, 5), mock.clone());
        limiter.apply_grant(12);

        tick(&limiter).await.unwrap();

        assert_eq!(limiter.get_statistics().current_available_permits, 5);
        assert_eq!(mock.release_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transport_failure_does_not_advance_seq() {
        let mock = Arc::new(MockCoordinator {
            fail_try_acquire: AtomicBool::new(true),
            ..Default::default()
        });
        let limiter = ClientLimiter::new_without_reconciler(config(100, 5), mock.clone());

        let seq_before = limiter.next_seq.load(Ordering::Relaxed);
        let backoff = tick(&limiter).await;
        assert_eq!(backoff, Err(TRANSPORT_RETRY_BACKOFF));
        assert_eq!(limiter.next_seq.load(Ordering::Relaxed), seq_before);
    }

    #[tokio::test]
    async fn a_queued_waiter_suppresses_surplus_return() {
        let mock = Arc::new(MockCoordinator::default());
        let limiter = ClientLimiter::new_without_reconciler(config(100, 5), mock.clone());
        limiter.apply_grant(12); // above target (5), but...

        // ...request more than is locally available, forcing real queueing
        // rather than an immediate fast-path grant.
        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire_async(20, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.get_statistics().current_queued_count > 0);

        tick(&limiter).await.unwrap();

        // `reserve_surplus` must not return capacity to the coordinator
        // while a waiter is queued on this client, even though local_available
        // exceeds target.
        assert_eq!(mock.release_calls.load(Ordering::Relaxed), 0);

        waiter.abort();
    }
}
