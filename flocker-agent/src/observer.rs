//! Local observation: assemble a fresh picture of this node from the
//! container engine and the volume driver.
//!
//! The agent's knowledge of local state is canonical; it publishes
//! snapshots upward and never edits desired configuration. Volumes attached
//! to this host become primary manifestations; unattached cluster volumes
//! are reported as the non-manifest dataset set.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

use flocker_common::model::{
    Dataset, Manifestation, NodeState, NonManifestDatasets, StateChange,
};
use flocker_drivers::{BlockDeviceApi, BlockDeviceVolume};

use crate::engine::ContainerEngine;

/// One observation round: the published state changes plus the raw driver
/// view the planner needs.
pub struct Observation {
    pub node_state: NodeState,
    pub nonmanifest: NonManifestDatasets,
    pub volumes: Vec<BlockDeviceVolume>,
    pub instance_id: String,
}

impl Observation {
    pub fn changes(&self) -> Vec<StateChange> {
        vec![
            StateChange::Node(self.node_state.clone()),
            StateChange::NonManifest(self.nonmanifest.clone()),
        ]
    }
}

pub struct Observer {
    node_uuid: Uuid,
    address: String,
    engine: Arc<dyn ContainerEngine>,
    driver: Arc<dyn BlockDeviceApi>,
}

impl Observer {
    pub fn new(
        node_uuid: Uuid,
        address: impl Into<String>,
        engine: Arc<dyn ContainerEngine>,
        driver: Arc<dyn BlockDeviceApi>,
    ) -> Self {
        Observer {
            node_uuid,
            address: address.into(),
            engine,
            driver,
        }
    }

    pub async fn observe(&self) -> Result<Observation> {
        let instance_id = self.driver.compute_instance_id().await?;
        let containers = self.engine.list().await?;
        let volumes = self.driver.list_volumes().await?;

        let mut node_state = NodeState::new(self.node_uuid, self.address.clone());
        node_state.containers = containers;
        let mut nonmanifest = BTreeMap::new();

        for volume in &volumes {
            let mut dataset = Dataset::new(volume.dataset_id);
            dataset.maximum_size = Some(volume.size);
            match volume.attached_to.as_deref() {
                Some(attached) if attached == instance_id => {
                    node_state.manifestations.insert(
                        volume.dataset_id,
                        Manifestation {
                            dataset,
                            primary: true,
                        },
                    );
                    match self.driver.get_device_path(&volume.volume_id).await {
                        Ok(path) => {
                            node_state.paths.insert(volume.dataset_id, path);
                        }
                        Err(e) => {
                            // Raced a detach; the next round sees the truth.
                            warn!(volume = %volume.volume_id, error = %e, "device path lookup failed");
                        }
                    }
                }
                Some(_) => {
                    // Attached to some other node; its agent reports it.
                }
                None => {
                    nonmanifest.insert(volume.dataset_id, dataset);
                }
            }
        }

        Ok(Observation {
            node_state,
            nonmanifest: NonManifestDatasets {
                datasets: nonmanifest,
            },
            volumes,
            instance_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FakeEngine;
    use flocker_common::model::Application;
    use flocker_drivers::MemoryBlockDeviceApi;
    use std::collections::BTreeSet;

    fn app(name: &str) -> Application {
        Application {
            name: name.to_string(),
            image: "busybox:latest".parse().unwrap(),
            ports: BTreeSet::new(),
            links: BTreeSet::new(),
            environment: BTreeMap::new(),
            memory_limit: None,
            cpu_shares: None,
            volume: None,
        }
    }

    #[tokio::test]
    async fn observation_separates_manifest_and_nonmanifest_volumes() {
        let engine = Arc::new(FakeEngine::default());
        let driver = Arc::new(MemoryBlockDeviceApi::new("node-1", 0));
        engine.seed(app("web"), true).await;

        let attached_dataset = Uuid::new_v4();
        let loose_dataset = Uuid::new_v4();
        let created = driver
            .create_volume(attached_dataset, flocker_drivers::GIB)
            .await
            .unwrap();
        driver
            .attach_volume(&created.volume_id, "node-1")
            .await
            .unwrap();
        driver
            .create_volume(loose_dataset, flocker_drivers::GIB)
            .await
            .unwrap();

        let node_uuid = Uuid::new_v4();
        let observer = Observer::new(node_uuid, "10.0.0.1", engine, driver);
        let observation = observer.observe().await.unwrap();

        assert_eq!(observation.node_state.node_uuid, node_uuid);
        assert_eq!(observation.node_state.containers.len(), 1);
        assert!(observation
            .node_state
            .manifestations
            .get(&attached_dataset)
            .map(|m| m.primary)
            .unwrap_or(false));
        assert!(observation.node_state.paths.contains_key(&attached_dataset));
        assert!(observation.nonmanifest.datasets.contains_key(&loose_dataset));
        assert!(!observation
            .node_state
            .manifestations
            .contains_key(&loose_dataset));
        assert_eq!(observation.changes().len(), 2);
    }

    #[tokio::test]
    async fn volumes_attached_elsewhere_are_not_ours_to_report() {
        let engine = Arc::new(FakeEngine::default());
        let driver = Arc::new(MemoryBlockDeviceApi::new("node-1", 0));
        let dataset_id = Uuid::new_v4();
        let created = driver
            .create_volume(dataset_id, flocker_drivers::GIB)
            .await
            .unwrap();
        driver
            .attach_volume(&created.volume_id, "node-2")
            .await
            .unwrap();

        let observer = Observer::new(Uuid::new_v4(), "10.0.0.1", engine, driver);
        let observation = observer.observe().await.unwrap();
        assert!(observation.node_state.manifestations.is_empty());
        assert!(observation.nonmanifest.datasets.is_empty());
    }
}
