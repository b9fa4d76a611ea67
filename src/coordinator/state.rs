//! Internal coordinator state.

use crate::identity::ClientHandle;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Per-client bookkeeping the coordinator keeps.
pub(super) struct ClientState {
    /// Permits currently charged to this client.
    pub(super) in_use: u32,

    /// Monotonic timestamp of the most recent request or heartbeat.
    pub(super) last_seen: Instant,

    /// Highest `seq` observed from this client.
    pub(super) seq: u64,

    /// Grant returned for the highest-observed `seq`, when that call was a
    /// `TryAcquire` — replayed verbatim if `seq` is retried.
    pub(super) last_acquired_grant: u32,

    /// Permit count the client last asked for and could not fully receive,
    /// if any. Cleared once capacity is found or the client is purged.
    pub(super) pending_request: Option<u32>,
}

impl ClientState {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            in_use: 0,
            last_seen: now,
            seq: 0,
            last_acquired_grant: 0,
            pending_request: None,
        }
    }
}

/// All coordinator-owned state, behind a single mutex.
pub(super) struct CoordinatorState {
    /// `availablePermits` — integer in `[0, N]`.
    pub(super) available_permits: u32,

    /// `client identity -> ClientState`.
    pub(super) clients: HashMap<ClientHandle, ClientState>,

    /// FIFO of clients awaiting capacity. A client identity appears at most
    /// once (enforced by `try_acquire` only pushing when `pending_request`
    /// was previously empty).
    pub(super) pending_clients: VecDeque<ClientHandle>,
}

impl CoordinatorState {
    pub(super) fn new(global_permit_count: u32) -> Self {
        Self {
            available_permits: global_permit_count,
            clients: HashMap::new(),
            pending_clients: VecDeque::new(),
        }
    }
}
