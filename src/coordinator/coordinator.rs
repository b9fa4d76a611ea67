//! The singleton coordinator: cluster-wide authority over the permit pool.
//!
//! Modeled the way the teacher crate's `ConcurrencyLimiter` models a single
//! process's permit pool — state behind a `parking_lot::Mutex`, handlers
//! that never hold the lock across an `.await` — generalized so the "pool"
//! is shared across a whole cluster of clients rather than one process's
//! waiters. Per spec §4.2, this is a logically single-threaded, reentrant
//! actor: independent calls may interleave at suspension points, but no two
//! handlers mutate state concurrently, which the mutex gives us for free
//! since no handler here awaits while holding it.

use crate::coordinator::config::CoordinatorConfig;
use crate::coordinator::state::{ClientState, CoordinatorState};
use crate::core::CoordinatorError;
use crate::identity::ClientHandle;
use crate::transport::CoordinatorApi;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A point-in-time view of coordinator-wide state, for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    /// `availablePermits`.
    pub available_permits: u32,
    /// Number of clients currently known to the coordinator.
    pub client_count: usize,
    /// Sum of `inUse` across all known clients — should satisfy
    /// `available_permits + total_in_use == global_permit_count` at rest.
    pub total_in_use: u32,
}

/// Singleton, cluster-wide authority over the permit pool.
pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    config: CoordinatorConfig,
    purge_cancel: CancellationToken,
}

impl Coordinator {
    /// Create a new coordinator. Does not spawn anything — the host must
    /// spawn [`Coordinator::run_idle_purge`] for idle reclamation to happen
    /// on its own timer (opportunistic purging still happens inline on every
    /// `try_acquire`/`release`).
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let state = CoordinatorState::new(config.global_permit_count);
        Arc::new(Self {
            state: Mutex::new(state),
            config,
            purge_cancel: CancellationToken::new(),
        })
    }

    /// Run the periodic idle-purge timer. Intended to be spawned once by the
    /// host: `tokio::spawn({ let c = coordinator.clone(); async move { c.run_idle_purge().await } })`.
    pub async fn run_idle_purge(&self) {
        let mut interval = tokio::time::interval(self.config.idle_purge_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let mut state = self.state.lock();
                    self.drop_idle_clients(&mut state, now);
                    service_pending(&mut state);
                }
                _ = self.purge_cancel.cancelled() => break,
            }
        }
    }

    /// Stop the idle-purge timer spawned via `run_idle_purge`.
    pub fn shutdown(&self) {
        self.purge_cancel.cancel();
    }

    /// A snapshot of pool-wide state, useful for tests asserting the
    /// conservation invariant (P1) and for host-side monitoring.
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.state.lock();
        let total_in_use: u32 = state.clients.values().map(|s| s.in_use).sum();
        CoordinatorSnapshot {
            available_permits: state.available_permits,
            client_count: state.clients.len(),
            total_in_use,
        }
    }

    /// `availablePermits + Σ inUse` for every client removed during this
    /// scan is credited back, capped at `N`. Called opportunistically from
    /// every RPC handler and from the periodic purge timer.
    fn drop_idle_clients(&self, state: &mut CoordinatorState, now: Instant) {
        let idle_timeout = self.config.idle_client_timeout;
        let global = self.config.global_permit_count;

        let mut reclaimed: Vec<(ClientHandle, u32)> = Vec::new();
        state.clients.retain(|handle, s| {
            if now.saturating_duration_since(s.last_seen) > idle_timeout {
                reclaimed.push((handle.clone(), s.in_use));
                false
            } else {
                true
            }
        });

        for (handle, in_use) in reclaimed {
            state.available_permits = (state.available_permits + in_use).min(global);
            tracing::info!(
                client_id = handle.id(),
                reclaimed_permits = in_use,
                "idle purge reclaimed client"
            );
        }
    }
}

#[async_trait]
impl CoordinatorApi for Coordinator {
    async fn try_acquire(
        &self,
        client: ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<u32, CoordinatorError> {
        if permits > self.config.global_permit_count {
            return Err(CoordinatorError::InvalidArgument(format!(
                "permits {permits} exceeds global_permit_count {}",
                self.config.global_permit_count
            )));
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        {
            let entry = state
                .clients
                .entry(client.clone())
                .or_insert_with(|| ClientState::new(now));
            entry.last_seen = now;

            if seq <= entry.seq {
                return Ok(entry.last_acquired_grant);
            }
        }

        self.drop_idle_clients(&mut state, now);

        let granted = if state.available_permits >= permits {
            state.available_permits -= permits;
            let entry = state
                .clients
                .get_mut(&client)
                .expect("entry created above survives drop_idle_clients since last_seen == now");
            entry.in_use += permits;
            entry.pending_request = None;
            permits
        } else {
            let already_pending = state
                .clients
                .get(&client)
                .map(|s| s.pending_request.is_some())
                .unwrap_or(false);
            if !already_pending {
                if let Some(entry) = state.clients.get_mut(&client) {
                    entry.pending_request = Some(permits);
                }
                state.pending_clients.push_back(client.clone());
            }
            0
        };

        if let Some(entry) = state.clients.get_mut(&client) {
            entry.seq = seq;
            entry.last_acquired_grant = granted;
        }

        service_pending(&mut state);

        Ok(granted)
    }

    async fn release(
        &self,
        client: ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<(), CoordinatorError> {
        if permits > self.config.global_permit_count {
            return Err(CoordinatorError::InvalidArgument(format!(
                "permits {permits} exceeds global_permit_count {}",
                self.config.global_permit_count
            )));
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        {
            let entry = state
                .clients
                .entry(client.clone())
                .or_insert_with(|| ClientState::new(now));
            entry.last_seen = now;

            if seq <= entry.seq {
                return Ok(());
            }
        }

        self.drop_idle_clients(&mut state, now);

        let global = self.config.global_permit_count;
        if let Some(entry) = state.clients.get_mut(&client) {
            if permits > entry.in_use {
                tracing::error!(
                    client_id = client.id(),
                    in_use = entry.in_use,
                    permits,
                    "release exceeds permits charged to client; clamping"
                );
                let reclaimed = entry.in_use;
                entry.in_use = 0;
                state.available_permits = (state.available_permits + reclaimed).min(global);
            } else {
                entry.in_use -= permits;
                state.available_permits = (state.available_permits + permits).min(global);
            }
            let entry = state.clients.get_mut(&client).expect("just updated above");
            entry.seq = seq;
            entry.last_acquired_grant = 0;
        }

        service_pending(&mut state);

        Ok(())
    }

    async fn refresh_lease(&self, client: ClientHandle) {
        let mut state = self.state.lock();
        if let Some(entry) = state.clients.get_mut(&client) {
            entry.last_seen = Instant::now();
        }
    }

    async fn unregister(&self, client: ClientHandle) {
        let mut state = self.state.lock();
        if let Some(entry) = state.clients.remove(&client) {
            state.available_permits =
                (state.available_permits + entry.in_use).min(self.config.global_permit_count);
        }
        service_pending(&mut state);
    }
}

/// Wake queued clients whose pending request capacity is now available.
///
/// This only sends an advisory notification — per spec, the coordinator
/// never hands out a grant without a corresponding `seq` from the client, so
/// the client must re-issue `TryAcquire` after being notified.
fn service_pending(state: &mut CoordinatorState) {
    loop {
        let Some(head) = state.pending_clients.front().cloned() else {
            break;
        };

        let Some(client_state) = state.clients.get(&head) else {
            state.pending_clients.pop_front();
            continue;
        };

        let Some(pending) = client_state.pending_request else {
            state.pending_clients.pop_front();
            continue;
        };

        if state.available_permits >= pending {
            let approx = state.available_permits;
            if let Some(entry) = state.clients.get_mut(&head) {
                entry.pending_request = None;
            }
            state.pending_clients.pop_front();

            match head.callback() {
                Some(cb) => cb.on_permits_available(approx),
                None => tracing::debug!(client_id = head.id(), "notify skipped: client gone"),
            }
        } else {
            break;
        }
    }
}
