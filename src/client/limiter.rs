//! The process-local client limiter.

use crate::client::config::ClientLimiterConfig;
use crate::client::reconciler;
use crate::core::{ClientError, MetadataName, RateLimitLease, RateLimiter, RateLimiterStatistics};
use crate::identity::ClientHandle;
use crate::transport::{ClientCallback, CoordinatorApi};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A single queued `AcquireAsync` request waiting for local capacity.
pub(super) struct Waiter {
    pub(super) id: u64,
    pub(super) count: u32,
    pub(super) response: oneshot::Sender<Result<RateLimitLease, ClientError>>,
}

/// All mutable client-limiter state, behind a single lock.
pub(super) struct LimiterState {
    /// `localAvailable` — this process's cached share of the global pool.
    pub(super) local_available: u32,

    /// FIFO of queued `AcquireAsync` requests, oldest first.
    pub(super) waiter_queue: VecDeque<Waiter>,

    /// Sum of `count` across `waiter_queue` — the spec's `outstandingWaiterPermits`.
    pub(super) outstanding_waiter_permits: u32,

    /// Permits currently checked out to live leases (not yet disposed).
    ///
    /// Not part of the spec's literal state list, which names only
    /// `localAvailable`/`waiterQueue`/`outstandingWaiterPermits` — but
    /// `idleSince`'s definition ("empty while at least one permit is in use
    /// or one waiter is queued") needs *some* concrete way to know whether a
    /// permit is in use, and this is the minimal counter that provides it.
    /// See DESIGN.md.
    pub(super) in_use_locally: u32,

    /// Set the instant both `outstanding_waiter_permits` and `in_use_locally`
    /// last became zero together; cleared the instant either becomes
    /// nonzero.
    pub(super) idle_since: Option<Instant>,

    /// `true` once `shutdown` has run to completion.
    pub(super) disposed: bool,
}

impl LimiterState {
    fn new() -> Self {
        Self {
            local_available: 0,
            waiter_queue: VecDeque::new(),
            outstanding_waiter_permits: 0,
            in_use_locally: 0,
            idle_since: Some(Instant::now()),
            disposed: false,
        }
    }

    fn mark_active(&mut self) {
        self.idle_since = None;
    }
}

/// A process-local view onto the cluster-wide permit pool.
///
/// Implements [`RateLimiter`] for the host. Internally it keeps a small
/// local cache (`localAvailable`) replenished and drained by a single
/// background reconciler task against a [`CoordinatorApi`], so that most
/// acquisitions never leave the process.
///
/// Always constructed behind an `Arc` (see [`ClientLimiter::new`]): the
/// reconciler task and queued leases both need a stable handle back to the
/// limiter that outlives any individual call.
pub struct ClientLimiter {
    pub(super) state: Mutex<LimiterState>,
    pub(super) config: ClientLimiterConfig,
    pub(super) coordinator: Arc<dyn CoordinatorApi>,
    pub(super) handle: OnceLock<ClientHandle>,
    pub(super) next_seq: AtomicU64,
    pub(super) next_waiter_id: AtomicU64,
    pub(super) notify: Notify,
    pub(super) reconciler_cancel: CancellationToken,
    pub(super) reconciler_task: Mutex<Option<JoinHandle<()>>>,
    pub(super) self_weak: Weak<ClientLimiter>,
    pub(super) successful_leases: AtomicU64,
    pub(super) failed_leases: AtomicU64,
}

impl ClientLimiter {
    /// Construct a client limiter and start its background reconciler.
    ///
    /// The reconciler is spawned here (self-spawned, rather than handed to
    /// the host to drive as the teacher's workers were) — see DESIGN.md for
    /// why. Callers wanting deterministic control over reconciler ticks in
    /// tests should use [`Self::new_without_reconciler`] and drive
    /// [`reconciler::tick`] manually instead.
    pub fn new(config: ClientLimiterConfig, coordinator: Arc<dyn CoordinatorApi>) -> Arc<Self> {
        let limiter = Self::new_without_reconciler(config, coordinator);
        let reconciler_handle = tokio::spawn(reconciler::run(limiter.clone()));
        *limiter.reconciler_task.lock() = Some(reconciler_handle);
        limiter
    }

    /// Construct a client limiter without starting its reconciler task.
    ///
    /// Exposed for tests that want to call [`reconciler::tick`] by hand
    /// instead of racing a background task.
    pub fn new_without_reconciler(
        config: ClientLimiterConfig,
        coordinator: Arc<dyn CoordinatorApi>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(LimiterState::new()),
            config,
            coordinator,
            handle: OnceLock::new(),
            next_seq: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
            notify: Notify::new(),
            reconciler_cancel: CancellationToken::new(),
            reconciler_task: Mutex::new(None),
            self_weak: weak.clone(),
            successful_leases: AtomicU64::new(0),
            failed_leases: AtomicU64::new(0),
        })
    }

    /// The identity this limiter presents to the coordinator, minting one on
    /// first use. Only the reconciler calls this; plain `attempt_acquire`/
    /// `acquire_async` calls never need an identity since they only touch
    /// local state.
    pub(super) fn handle(self: &Arc<Self>) -> ClientHandle {
        self.handle
            .get_or_init(|| ClientHandle::new(self.clone() as Arc<dyn ClientCallback>))
            .clone()
    }

    /// Wake the reconciler — a new waiter enqueued, a waiter cancelled, or a
    /// lease returned all change the deficit/surplus calculation.
    pub(super) fn wake_reconciler(&self) {
        self.notify.notify_one();
    }

    fn create_lease(self: &Arc<Self>, permit_count: u32) -> RateLimitLease {
        if permit_count == 0 {
            return RateLimitLease::success();
        }
        let weak = self.self_weak.clone();
        RateLimitLease::success_with_cleanup(move || {
            if let Some(limiter) = weak.upgrade() {
                limiter.release(permit_count);
            }
        })
    }

    /// Return `permit_count` previously-held permits to the local cache,
    /// draining any waiters it can now satisfy. Called by a lease's `Drop`
    /// cleanup; also reused internally to apply a positive `TryAcquire`
    /// grant from the reconciler (see `reconciler::apply_grant`), in which
    /// case the permits were never "in use" so no `in_use_locally` debit
    /// precedes the credit.
    pub(super) fn release(self: &Arc<Self>, permit_count: u32) {
        if permit_count == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.in_use_locally = state.in_use_locally.saturating_sub(permit_count);
        state.local_available += permit_count;
        let stale_leases = self.drain_with_real_leases(&mut state);
        drop(state);
        drop(stale_leases);
        self.wake_reconciler();
    }

    /// Apply newly-acquired cluster capacity: adds to the local cache and
    /// drains waiters, but — unlike `release` — doesn't touch
    /// `in_use_locally`, since this capacity was never checked out to a
    /// lease before now.
    pub(super) fn apply_grant(self: &Arc<Self>, permit_count: u32) {
        if permit_count == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.local_available += permit_count;
        let stale_leases = self.drain_with_real_leases(&mut state);
        drop(state);
        drop(stale_leases);
        self.wake_reconciler();
    }

    /// Drain as many queued waiters, FIFO, as `state.local_available` can
    /// now satisfy, handing each a real cleanup-bearing lease. Shared by
    /// `release` (a lease was returned) and `apply_grant` (the reconciler
    /// landed a positive `TryAcquire`) — both are "local capacity just grew,
    /// see who that wakes up".
    ///
    /// Prunes zombie waiters (receiver already dropped, e.g. the host
    /// dropped an `acquire_async` future without a cancel token) out of the
    /// queue as it walks it, mirroring the teacher's
    /// `process_queue_internal`'s `response.is_closed()` check — otherwise a
    /// dead waiter sits in `waiter_queue` forever, holding its share of
    /// `outstanding_waiter_permits` hostage.
    ///
    /// Returns any leases whose `send` still raced a closing receiver
    /// despite the `is_closed` check (the receiver can drop between the
    /// check and the send). The caller must drop these *after* releasing
    /// `state`'s lock: each lease's cleanup calls back into
    /// [`Self::release`], which re-locks the same non-reentrant mutex.
    #[must_use]
    fn drain_with_real_leases(self: &Arc<Self>, state: &mut LimiterState) -> Vec<RateLimitLease> {
        let mut granted = Vec::new();
        while let Some(front) = state.waiter_queue.front() {
            if front.response.is_closed() {
                let waiter = state.waiter_queue.pop_front().expect("front() just returned Some");
                state.outstanding_waiter_permits -= waiter.count;
                continue;
            }
            if front.count > state.local_available {
                break;
            }
            let waiter = state.waiter_queue.pop_front().expect("front() just returned Some");
            state.local_available -= waiter.count;
            state.outstanding_waiter_permits -= waiter.count;
            granted.push(waiter);
        }

        let mut stale_leases = Vec::new();
        for waiter in granted {
            let lease = self.create_lease(waiter.count);
            match waiter.response.send(Ok(lease)) {
                Ok(()) => state.in_use_locally += waiter.count,
                Err(Ok(lease)) => {
                    // Cancelled concurrently with being granted, after the
                    // is_closed check above already passed. Don't drop the
                    // lease here — its cleanup calls back into `release`
                    // and would deadlock on this same lock. Hand it back to
                    // the caller to drop once unlocked instead; that drop
                    // runs the cleanup, which credits `waiter.count` back to
                    // `local_available` through the normal `release` path.
                    stale_leases.push(lease);
                }
                Err(Err(_)) => unreachable!("oneshot::Sender::send only returns the value it was given"),
            }
        }

        if state.outstanding_waiter_permits == 0 && state.in_use_locally == 0 {
            state.idle_since = Some(Instant::now());
        }

        stale_leases
    }

    /// Resolve a racing cancellation against a queued waiter.
    ///
    /// If the waiter is still in the queue, removes it and rolls back its
    /// share of `outstanding_waiter_permits` — nothing was ever granted, so
    /// there's nothing to leak. If it's already gone (the reconciler or a
    /// release beat the cancellation to it), the grant already sent into
    /// `rx` is retrieved and honored instead of being discarded, per the
    /// no-leak cancellation rule.
    async fn resolve_cancellation(
        self: &Arc<Self>,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Result<RateLimitLease, ClientError>>,
    ) -> Result<RateLimitLease, ClientError> {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiter_queue.iter().position(|w| w.id == waiter_id) {
            let waiter = state.waiter_queue.remove(pos).expect("position() just found it");
            state.outstanding_waiter_permits -= waiter.count;
            if state.outstanding_waiter_permits == 0 && state.in_use_locally == 0 {
                state.idle_since = Some(Instant::now());
            }
            drop(state);
            self.wake_reconciler();
            return Err(ClientError::Cancelled);
        }
        drop(state);

        match rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(ClientError::Cancelled),
        }
    }

    fn validate_permit_count(&self, permit_count: u32) -> Result<(), ClientError> {
        if permit_count > self.config.global_permit_count {
            return Err(ClientError::InvalidArgument(format!(
                "permit_count {permit_count} exceeds global_permit_count {}",
                self.config.global_permit_count
            )));
        }
        Ok(())
    }

    /// Best-effort synchronous teardown, mirroring what a host that dropped
    /// the limiter without calling `shutdown` gets for free: the reconciler
    /// is cancelled and queued waiters are failed, but the coordinator is
    /// never told — that requires an RPC and can only happen in the async
    /// `shutdown` path.
    fn dispose_sync(&self) {
        self.reconciler_cancel.cancel();
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        for waiter in state.waiter_queue.drain(..) {
            let _ = waiter.response.send(Ok(RateLimitLease::failed(None)));
        }
        state.outstanding_waiter_permits = 0;
    }

    /// Run one reconciliation pass (heartbeat-independent: request more
    /// permits if short, return surplus if flush) without waiting for the
    /// background reconciler's timer or wake signal.
    ///
    /// Meant for tests built on [`Self::new_without_reconciler`] that need
    /// deterministic control over when a client talks to its coordinator,
    /// rather than racing a spawned task. Returns the backoff the real
    /// reconciler would have slept for, if the coordinator call failed.
    pub async fn reconcile_once(self: &Arc<Self>) -> Result<(), Duration> {
        reconciler::tick(self).await
    }

    /// Full spec-mandated shutdown: cancels the reconciler, fails all queued
    /// waiters, and makes a best-effort `Unregister` call so the coordinator
    /// reclaims this client's charged permits immediately rather than
    /// waiting out the idle timeout.
    pub async fn shutdown(self: &Arc<Self>) {
        self.dispose_sync();

        let task = self.reconciler_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        if let Some(handle) = self.handle.get() {
            self.coordinator.unregister(handle.clone()).await;
        }
    }
}

impl ClientCallback for ClientLimiter {
    fn on_permits_available(&self, _approx_available: u32) {
        self.notify.notify_one();
    }
}

impl Drop for ClientLimiter {
    fn drop(&mut self) {
        self.dispose_sync();
    }
}

#[async_trait]
impl RateLimiter for Arc<ClientLimiter> {
    fn attempt_acquire(&self, permit_count: u32) -> Result<RateLimitLease, ClientError> {
        self.validate_permit_count(permit_count)?;

        let mut state = self.state.lock();
        if state.disposed {
            self.failed_leases.fetch_add(1, Ordering::Relaxed);
            return Ok(RateLimitLease::failed(None));
        }

        if permit_count == 0 {
            return if state.local_available > 0 {
                self.successful_leases.fetch_add(1, Ordering::Relaxed);
                Ok(RateLimitLease::success())
            } else {
                self.failed_leases.fetch_add(1, Ordering::Relaxed);
                Ok(RateLimitLease::failed(None))
            };
        }

        if state.local_available >= permit_count && state.outstanding_waiter_permits == 0 {
            state.local_available -= permit_count;
            state.in_use_locally += permit_count;
            state.mark_active();
            self.successful_leases.fetch_add(1, Ordering::Relaxed);
            Ok(self.create_lease(permit_count))
        } else {
            self.failed_leases.fetch_add(1, Ordering::Relaxed);
            Ok(RateLimitLease::failed(None))
        }
    }

    async fn acquire_async(
        &self,
        permit_count: u32,
        cancel_token: Option<CancellationToken>,
    ) -> Result<RateLimitLease, ClientError> {
        self.validate_permit_count(permit_count)?;

        let rx = {
            let mut state = self.state.lock();
            if state.disposed {
                self.failed_leases.fetch_add(1, Ordering::Relaxed);
                return Ok(RateLimitLease::failed(None));
            }

            if permit_count == 0 {
                self.successful_leases.fetch_add(1, Ordering::Relaxed);
                return Ok(RateLimitLease::success());
            }

            if state.local_available >= permit_count && state.outstanding_waiter_permits == 0 {
                state.local_available -= permit_count;
                state.in_use_locally += permit_count;
                state.mark_active();
                self.successful_leases.fetch_add(1, Ordering::Relaxed);
                return Ok(self.create_lease(permit_count));
            }

            if state.outstanding_waiter_permits + permit_count > self.config.queue_limit {
                self.failed_leases.fetch_add(1, Ordering::Relaxed);
                return Ok(RateLimitLease::failed(None)
                    .with_metadata(MetadataName::FAILURE_REASON, "Queue limit reached".to_string()));
            }

            let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiter_queue.push_back(Waiter {
                id: waiter_id,
                count: permit_count,
                response: tx,
            });
            state.outstanding_waiter_permits += permit_count;
            state.mark_active();
            (waiter_id, rx)
        };
        let (waiter_id, mut rx) = rx;

        self.wake_reconciler();

        match cancel_token {
            None => rx.await.unwrap_or(Err(ClientError::Cancelled)),
            Some(token) => {
                tokio::select! {
                    result = &mut rx => result.unwrap_or(Err(ClientError::Cancelled)),
                    _ = token.cancelled() => self.resolve_cancellation(waiter_id, rx).await,
                }
            }
        }
    }

    fn get_statistics(&self) -> RateLimiterStatistics {
        let state = self.state.lock();
        RateLimiterStatistics::new(
            i64::from(state.local_available),
            state.waiter_queue.len() as u32,
            self.successful_leases.load(Ordering::Relaxed),
            self.failed_leases.load(Ordering::Relaxed),
        )
    }

    fn idle_duration(&self) -> Option<Duration> {
        let state = self.state.lock();
        state.idle_since.map(|since| since.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Coordinator, CoordinatorConfig};

    fn client_config(global: u32, target: u32, queue_limit: u32) -> ClientLimiterConfig {
        ClientLimiterConfig::new(global, target, queue_limit, Duration::from_secs(30)).unwrap()
    }

    fn coordinator(global: u32) -> Arc<Coordinator> {
        Coordinator::new(CoordinatorConfig::new(global, Duration::from_secs(60)).unwrap())
    }

    #[tokio::test]
    async fn zero_permit_probe_reflects_local_cache_state() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(100, 10, 50), coordinator(100));

        // Nothing reconciled yet: no-op acquire fails.
        let lease = limiter.attempt_acquire(0).unwrap();
        assert!(!lease.is_acquired());

        limiter.reconcile_once().await.unwrap();

        // Local cache now holds the target share: no-op acquire succeeds and
        // doesn't touch the cache.
        let before = limiter.get_statistics().current_available_permits;
        let lease = limiter.attempt_acquire(0).unwrap();
        assert!(lease.is_acquired());
        assert_eq!(limiter.get_statistics().current_available_permits, before);
    }

    #[tokio::test]
    async fn permit_count_over_global_cap_is_invalid_argument() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(10, 5, 10), coordinator(10));

        assert!(matches!(
            limiter.attempt_acquire(11),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.acquire_async(11, None).await,
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn attempt_acquire_never_steals_from_queued_waiters() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(10, 5, 50), coordinator(10));
        limiter.reconcile_once().await.unwrap();

        // Enqueue a waiter for more than is locally available so it can't be
        // satisfied immediately; outstanding_waiter_permits becomes nonzero.
        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire_async(10, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.get_statistics().current_queued_count > 0);

        // Even though localAvailable > 0, attempt_acquire must not steal it
        // out from under the queued waiter.
        let lease = limiter.attempt_acquire(1).unwrap();
        assert!(!lease.is_acquired());

        waiter.abort();
    }

    #[tokio::test]
    async fn acquire_async_fills_from_local_cache_without_queueing() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(100, 20, 50), coordinator(100));
        limiter.reconcile_once().await.unwrap();

        let lease = limiter.acquire_async(5, None).await.unwrap();
        assert!(lease.is_acquired());
        assert_eq!(limiter.get_statistics().current_queued_count, 0);
    }

    #[tokio::test]
    async fn queue_overflow_carries_reason_phrase() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(100, 1, 5), coordinator(100));

        // No reconciler running, so these permanently queue rather than fill.
        let l1 = limiter.clone();
        let w1 = tokio::spawn(async move { l1.acquire_async(5, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.get_statistics().current_queued_count, 1);

        // A second request would push outstanding_waiter_permits past queue_limit.
        let lease = limiter.acquire_async(1, None).await.unwrap();
        assert!(!lease.is_acquired());
        assert_eq!(
            lease.try_get_metadata::<String>(MetadataName::FAILURE_REASON).unwrap(),
            "Queue limit reached"
        );

        w1.abort();
    }

    #[tokio::test]
    async fn cancellation_before_fulfilment_refunds_queue_accounting() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(100, 1, 50), coordinator(100));
        let cancel = CancellationToken::new();

        let l = limiter.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { l.acquire_async(10, Some(c)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.get_statistics().current_queued_count, 1);

        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(limiter.get_statistics().current_queued_count, 0);
    }

    #[tokio::test]
    async fn disposing_a_lease_drains_the_head_waiter() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(10, 10, 50), coordinator(10));
        limiter.reconcile_once().await.unwrap();

        let held = limiter.attempt_acquire(10).unwrap();
        assert!(held.is_acquired());

        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire_async(4, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.get_statistics().current_queued_count, 1);

        drop(held);

        let lease = waiter.await.unwrap().unwrap();
        assert!(lease.is_acquired());
        assert_eq!(limiter.get_statistics().current_queued_count, 0);
    }

    #[tokio::test]
    async fn dropping_a_waiter_future_without_a_cancel_token_does_not_deadlock_the_next_release() {
        // Mirrors wrapping `acquire_async` in `tokio::time::timeout` and
        // letting it expire: the host abandons the future, no `cancel_token`
        // ever fires, and the waiter's oneshot receiver is simply dropped.
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(10, 10, 50), coordinator(10));
        limiter.reconcile_once().await.unwrap();

        let held = limiter.attempt_acquire(10).unwrap();
        assert!(held.is_acquired());

        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire_async(4, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.get_statistics().current_queued_count, 1);

        waiter.abort();
        let _ = waiter.await;

        // Releasing the held permits must drain (and prune) the now-dead
        // waiter without deadlocking on the limiter's own lock.
        drop(held);

        assert_eq!(limiter.get_statistics().current_queued_count, 0);

        // outstanding_waiter_permits must have been refunded rather than
        // left hostage by the zombie waiter, so a fresh request succeeds.
        let lease = limiter.attempt_acquire(5).unwrap();
        assert!(lease.is_acquired());
    }

    #[tokio::test]
    async fn shutdown_fails_all_queued_waiters_and_is_idempotent() {
        let limiter =
            ClientLimiter::new_without_reconciler(client_config(100, 1, 50), coordinator(100));

        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire_async(5, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        limiter.shutdown().await;
        let result = waiter.await.unwrap().unwrap();
        assert!(!result.is_acquired());

        // A second shutdown call (mirroring a double Dispose) must not panic
        // or double-unregister.
        limiter.shutdown().await;

        let lease = limiter.attempt_acquire(1).unwrap();
        assert!(!lease.is_acquired());
    }
}
