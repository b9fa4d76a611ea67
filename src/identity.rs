//! Client identity: the durable reference a coordinator keys its state by.
//!
//! The spec describes client identity abstractly as "a durable reference to
//! a callback endpoint owned by the client process." Since the concrete
//! transport (the cluster membership / actor-placement runtime) is out of
//! scope, this crate supplies a minimal concrete stand-in: an opaque
//! monotonic id paired with a weak handle back to the owning client's
//! callback, so the coordinator never keeps a client alive purely by holding
//! its identity.

use crate::transport::ClientCallback;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A client's identity as seen by the coordinator.
///
/// Cloning a `ClientHandle` is cheap (an `Arc` bump); equality and hashing
/// are defined over the opaque id alone, so a `ClientHandle` is a stable
/// `HashMap` key across clones.
#[derive(Clone)]
pub struct ClientHandle {
    id: u64,
    callback: Weak<dyn ClientCallback>,
}

impl ClientHandle {
    /// Mint a fresh identity wrapping `callback`.
    ///
    /// Each call allocates a new, globally unique id — a `ClientLimiter`
    /// should call this exactly once (lazily, on first use) and reuse the
    /// resulting handle for the rest of its lifetime.
    pub fn new(callback: Arc<dyn ClientCallback>) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::downgrade(&callback),
        }
    }

    /// The opaque id. Stable for the life of the owning client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Upgrade the stored callback, if the owning client is still alive.
    pub fn callback(&self) -> Option<Arc<dyn ClientCallback>> {
        self.callback.upgrade()
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

impl Hash for ClientHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCallback;
    impl ClientCallback for NoopCallback {
        fn on_permits_available(&self, _approx_available: u32) {}
    }

    #[test]
    fn distinct_handles_get_distinct_monotonic_ids() {
        let a = ClientHandle::new(Arc::new(NoopCallback));
        let b = ClientHandle::new(Arc::new(NoopCallback));
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn clones_share_identity() {
        let a = ClientHandle::new(Arc::new(NoopCallback));
        let cloned = a.clone();
        assert_eq!(a, cloned);
        assert_eq!(a.id(), cloned.id());
    }

    #[test]
    fn callback_upgrades_while_owner_is_alive() {
        let owner = Arc::new(NoopCallback);
        let handle = ClientHandle::new(owner.clone());
        assert!(handle.callback().is_some());
    }

    #[test]
    fn callback_fails_to_upgrade_once_owner_is_dropped() {
        let owner = Arc::new(NoopCallback);
        let handle = ClientHandle::new(owner.clone());
        drop(owner);
        assert!(handle.callback().is_none());
    }

    #[test]
    fn handle_is_a_stable_hashmap_key_across_clones() {
        use std::collections::HashMap;

        let a = ClientHandle::new(Arc::new(NoopCallback));
        let mut map = HashMap::new();
        map.insert(a.clone(), "first");

        assert_eq!(map.get(&a.clone()), Some(&"first"));
    }
}
