//! In-memory aggregation of per-node observed state.
//!
//! The control service folds every incoming state change into this store
//! and snapshots it for broadcasts and REST reads. Per-node updates are
//! last-writer-wins by arrival order. An update is only trusted for a fixed
//! TTL: nodes that stop reporting drop out of snapshots instead of serving
//! stale truth.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use flocker_common::model::{Dataset, DeploymentState, NodeState, StateChange};
use parking_lot::RwLock;
use uuid::Uuid;

struct StoredNode {
    state: NodeState,
    refreshed: Instant,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<Uuid, StoredNode>,
    nonmanifest: BTreeMap<Uuid, Dataset>,
}

pub struct StateStore {
    inner: RwLock<Inner>,
    ttl: Duration,
}

impl StateStore {
    pub fn new(ttl: Duration) -> Self {
        StateStore {
            inner: RwLock::new(Inner::default()),
            ttl,
        }
    }

    pub fn apply_changes(&self, changes: Vec<StateChange>) {
        let mut inner = self.inner.write();
        for change in changes {
            match change {
                StateChange::Node(state) => {
                    inner.nodes.insert(
                        state.node_uuid,
                        StoredNode {
                            state,
                            refreshed: Instant::now(),
                        },
                    );
                }
                StateChange::NonManifest(datasets) => {
                    inner.nonmanifest = datasets.datasets;
                }
            }
        }
    }

    /// Atomic snapshot of everything still within its TTL.
    pub fn as_deployment(&self) -> DeploymentState {
        let inner = self.inner.read();
        DeploymentState {
            nodes: inner
                .nodes
                .iter()
                .filter(|(_, stored)| stored.refreshed.elapsed() <= self.ttl)
                .map(|(uuid, stored)| (*uuid, stored.state.clone()))
                .collect(),
            nonmanifest: inner.nonmanifest.clone(),
        }
    }

    /// Agents currently known (fresh) to the cluster, as (uuid, address).
    pub fn known_nodes(&self) -> Vec<(Uuid, String)> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|stored| stored.refreshed.elapsed() <= self.ttl)
            .map(|stored| (stored.state.node_uuid, stored.state.address.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flocker_common::model::NonManifestDatasets;

    fn node_state(node_uuid: Uuid, address: &str) -> NodeState {
        NodeState::new(node_uuid, address)
    }

    #[test]
    fn per_node_updates_are_last_writer_wins() {
        let store = StateStore::new(Duration::from_secs(60));
        let node_uuid = Uuid::new_v4();

        store.apply_changes(vec![StateChange::Node(node_state(node_uuid, "10.0.0.1"))]);
        store.apply_changes(vec![StateChange::Node(node_state(node_uuid, "10.0.0.2"))]);

        let snapshot = store.as_deployment();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[&node_uuid].address, "10.0.0.2");
    }

    #[test]
    fn nonmanifest_set_is_replaced_wholesale() {
        let store = StateStore::new(Duration::from_secs(60));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store.apply_changes(vec![StateChange::NonManifest(NonManifestDatasets {
            datasets: BTreeMap::from([(first, Dataset::new(first))]),
        })]);
        store.apply_changes(vec![StateChange::NonManifest(NonManifestDatasets {
            datasets: BTreeMap::from([(second, Dataset::new(second))]),
        })]);

        let snapshot = store.as_deployment();
        assert!(!snapshot.nonmanifest.contains_key(&first));
        assert!(snapshot.nonmanifest.contains_key(&second));
    }

    #[tokio::test]
    async fn expired_nodes_drop_out_of_snapshots() {
        let store = StateStore::new(Duration::from_millis(20));
        let node_uuid = Uuid::new_v4();
        store.apply_changes(vec![StateChange::Node(node_state(node_uuid, "10.0.0.1"))]);

        assert_eq!(store.as_deployment().nodes.len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.as_deployment().nodes.is_empty());
        assert!(store.known_nodes().is_empty());

        // A fresh report brings the node back.
        store.apply_changes(vec![StateChange::Node(node_state(node_uuid, "10.0.0.1"))]);
        assert_eq!(store.known_nodes().len(), 1);
    }
}
