//! Latest-known cluster state shared between the watch tasks and the
//! reconciler.
//!
//! The store is the only mutable state shared across tasks. The mutex is
//! held across field assignments and snapshot clones only, never across
//! I/O; the reconciler takes a [`Snapshot`] under the lock and works on it
//! lock-free.

use crate::types::{nodes_equal, ClusterConfig, NodesList, ServicesIndex};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of applying a nodes update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdate {
    /// The delivered list was semantically equal to the held one.
    Noop,
    /// The held list was replaced.
    Updated,
}

/// An internally consistent view of `(config, nodes, services)`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Desired cluster configuration.
    pub config: Arc<ClusterConfig>,
    /// Latest node list.
    pub nodes: Arc<NodesList>,
    /// Service identity resolution index.
    pub services: Arc<ServicesIndex>,
}

struct Inner {
    config: Arc<ClusterConfig>,
    nodes: Arc<NodesList>,
    services: Arc<ServicesIndex>,
    last_inbound_update: Instant,
    last_reconcile: Instant,
    new_config: bool,
}

/// Shared store of the latest watch deliveries.
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Create an empty store. Both timestamps start now, so the first fast
    /// tick runs a parity check rather than skipping.
    pub fn new() -> Self {
        let now = Instant::now();
        Store {
            inner: Mutex::new(Inner {
                config: Arc::new(ClusterConfig::default()),
                nodes: Arc::new(NodesList::default()),
                services: Arc::new(ServicesIndex::default()),
                last_inbound_update: now,
                last_reconcile: now,
                new_config: false,
            }),
        }
    }

    /// Replace the configuration and arm one forced reconcile.
    pub fn apply_config(&self, config: ClusterConfig) {
        let mut inner = self.inner.lock();
        inner.config = Arc::new(config);
        inner.new_config = true;
        inner.last_inbound_update = Instant::now();
    }

    /// Replace the node list unless the delivery is semantically equal to
    /// the held one. The equality check holds the lock only to read; a
    /// no-op never invalidates the fast path.
    pub fn apply_nodes(&self, nodes: NodesList) -> NodeUpdate {
        {
            let inner = self.inner.lock();
            if nodes_equal(&inner.nodes, &nodes) {
                return NodeUpdate::Noop;
            }
        }
        let mut inner = self.inner.lock();
        inner.nodes = Arc::new(nodes);
        inner.last_inbound_update = Instant::now();
        NodeUpdate::Updated
    }

    /// Replace the services index.
    pub fn apply_services(&self, services: ServicesIndex) {
        let mut inner = self.inner.lock();
        inner.services = Arc::new(services);
        inner.last_inbound_update = Instant::now();
    }

    /// Take a consistent snapshot of the held state.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            config: Arc::clone(&inner.config),
            nodes: Arc::clone(&inner.nodes),
            services: Arc::clone(&inner.services),
        }
    }

    /// Test-and-clear the forced-reconcile flag.
    ///
    /// Called exactly once per fast tick; returns true on the first tick
    /// after a config delivery.
    pub fn should_force_reconcile(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.new_config)
    }

    /// Whether the last reconcile postdates the last inbound update, in
    /// which case the fast tick skips even the parity check.
    pub fn no_updates_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.last_reconcile > inner.last_inbound_update
    }

    /// Record a completed reconcile.
    pub fn stamp_reconcile(&self) {
        self.inner.lock().last_reconcile = Instant::now();
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;

    #[test]
    fn config_delivery_arms_exactly_one_forced_reconcile() {
        let store = Store::new();
        assert!(!store.should_force_reconcile());
        store.apply_config(ClusterConfig::default());
        assert!(store.should_force_reconcile());
        assert!(!store.should_force_reconcile());
    }

    #[test]
    fn equal_nodes_delivery_is_a_noop() {
        let store = Store::new();
        let nodes = vec![Node {
            name: "a".into(),
            ..Node::default()
        }];
        assert_eq!(store.apply_nodes(nodes.clone()), NodeUpdate::Updated);
        store.stamp_reconcile();
        assert_eq!(store.apply_nodes(nodes), NodeUpdate::Noop);
        // the no-op did not count as an inbound update
        assert!(store.no_updates_ready());
    }

    #[test]
    fn inbound_updates_unblock_the_fast_path() {
        let store = Store::new();
        assert!(!store.no_updates_ready());
        store.stamp_reconcile();
        assert!(store.no_updates_ready());
        store.apply_config(ClusterConfig::default());
        assert!(!store.no_updates_ready());
    }

    #[test]
    fn snapshot_is_internally_consistent() {
        let store = Store::new();
        let mut config = ClusterConfig::default();
        config.config.insert("10.0.0.1".into(), Default::default());
        store.apply_config(config);
        let snap = store.snapshot();
        store.apply_config(ClusterConfig::default());
        // the earlier snapshot still sees the config it was taken with
        assert!(snap.config.contains_vip("10.0.0.1"));
        assert!(!store.snapshot().config.contains_vip("10.0.0.1"));
    }
}
