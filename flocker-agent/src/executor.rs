//! Action execution: apply exactly one planned step through the container
//! engine, the volume driver and (for snapshot-capable storage) the
//! snapshot transfer.
//!
//! Every action is idempotent, so reissuing one after a crash or restart is
//! safe. Failures are classified as transient (absorbed, retried on the
//! next tick) or fatal (logged for attention); neither advances state.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;
use uuid::Uuid;

use flocker_common::model::{Application, Deployment, DeploymentState};
use flocker_drivers::snapshots::{FilesystemSnapshots, SnapshotName};
use flocker_drivers::{BlockDeviceApi, GIB};

use crate::observer::Observation;
use crate::planner::Action;
use crate::{engine::ContainerEngine, transfer};

/// Default allocation when a dataset has no configured maximum size.
pub const DEFAULT_DATASET_SIZE: u64 = 100 * GIB;

pub struct Executor {
    engine: Arc<dyn ContainerEngine>,
    driver: Arc<dyn BlockDeviceApi>,
    snapshots: Option<Arc<dyn FilesystemSnapshots>>,
    zpool: Option<String>,
}

impl Executor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        driver: Arc<dyn BlockDeviceApi>,
        snapshots: Option<Arc<dyn FilesystemSnapshots>>,
        zpool: Option<String>,
    ) -> Self {
        Executor {
            engine,
            driver,
            snapshots,
            zpool,
        }
    }

    pub async fn execute(
        &self,
        action: &Action,
        observation: &Observation,
        configuration: &Deployment,
        cluster: &DeploymentState,
    ) -> Result<()> {
        match action {
            Action::StopContainer { name } => self.engine.remove(name).await,
            Action::DetachVolume { volume_id, .. } => {
                self.driver.detach_volume(volume_id).await?;
                Ok(())
            }
            Action::DestroyDataset { volume_id, .. } => {
                self.driver.destroy_volume(volume_id).await?;
                Ok(())
            }
            Action::HandoffPrimary {
                dataset_id,
                target_node,
            } => {
                self.handoff(*dataset_id, *target_node, configuration, cluster)
                    .await
            }
            Action::ReceivePrimary {
                dataset_id,
                source_node,
            } => {
                self.receive(*dataset_id, *source_node, observation, configuration, cluster)
                    .await
            }
            Action::CreateDataset {
                dataset_id,
                maximum_size,
            } => {
                let size = maximum_size.unwrap_or(DEFAULT_DATASET_SIZE);
                let created = self.driver.create_volume(*dataset_id, size).await?;
                info!(dataset = %dataset_id, volume = %created.volume_id, size = created.size, "dataset created");
                Ok(())
            }
            Action::AttachVolume { volume_id, .. } => {
                self.driver
                    .attach_volume(volume_id, &observation.instance_id)
                    .await?;
                Ok(())
            }
            Action::StartContainer { application } => {
                self.start_container(application, observation).await
            }
        }
    }

    fn peer_address(
        &self,
        node: Uuid,
        configuration: &Deployment,
        cluster: &DeploymentState,
    ) -> Option<String> {
        cluster
            .nodes
            .get(&node)
            .map(|n| n.address.clone())
            .or_else(|| configuration.node(&node).map(|n| n.address.clone()))
            .filter(|a| !a.is_empty())
    }

    async fn next_snapshot(
        &self,
        snapshots: &Arc<dyn FilesystemSnapshots>,
        dataset_id: Uuid,
    ) -> Result<SnapshotName> {
        let sequence = snapshots
            .list()
            .await?
            .into_iter()
            .filter(|n| n.dataset_id == dataset_id)
            .map(|n| n.sequence)
            .max()
            .map(|s| s + 1)
            .unwrap_or(0);
        Ok(SnapshotName {
            dataset_id,
            sequence,
        })
    }

    async fn handoff(
        &self,
        dataset_id: Uuid,
        target_node: Uuid,
        configuration: &Deployment,
        cluster: &DeploymentState,
    ) -> Result<()> {
        let (Some(snapshots), Some(pool)) = (&self.snapshots, &self.zpool) else {
            // Block backend: the volume was already released by the detach
            // step; there is nothing left to stream.
            return Ok(());
        };
        let peer = self
            .peer_address(target_node, configuration, cluster)
            .ok_or_else(|| anyhow!("no address known for node {}", target_node))?;
        let name = self.next_snapshot(snapshots, dataset_id).await?;
        snapshots.create(&name).await?;
        transfer::push_snapshot(pool, &name, &peer).await?;
        info!(dataset = %dataset_id, target = %target_node, snapshot = %name, "primary handed off");
        Ok(())
    }

    async fn receive(
        &self,
        dataset_id: Uuid,
        source_node: Uuid,
        observation: &Observation,
        configuration: &Deployment,
        cluster: &DeploymentState,
    ) -> Result<()> {
        if let (Some(snapshots), Some(pool)) = (&self.snapshots, &self.zpool) {
            let peer = self
                .peer_address(source_node, configuration, cluster)
                .ok_or_else(|| anyhow!("no address known for node {}", source_node))?;
            if let Some(latest) = snapshots
                .list()
                .await?
                .into_iter()
                .filter(|n| n.dataset_id == dataset_id)
                .max()
            {
                transfer::pull_snapshot(pool, &latest, &peer).await?;
            }
        }

        // Take over the block volume, but only once the current primary has
        // let go: attaching while the source still holds it would mean two
        // simultaneous primaries.
        let volume = observation
            .volumes
            .iter()
            .find(|v| v.dataset_id == dataset_id)
            .ok_or_else(|| anyhow!("dataset {} has no backend volume yet", dataset_id))?;
        match volume.attached_to.as_deref() {
            None => {
                self.driver
                    .attach_volume(&volume.volume_id, &observation.instance_id)
                    .await?;
                info!(dataset = %dataset_id, source = %source_node, "primary received");
                Ok(())
            }
            Some(holder) if holder == observation.instance_id => Ok(()),
            Some(holder) => Err(anyhow!(
                "waiting for {} to release dataset {}",
                holder,
                dataset_id
            )),
        }
    }

    async fn start_container(
        &self,
        application: &Application,
        observation: &Observation,
    ) -> Result<()> {
        let device_path = match &application.volume {
            None => None,
            Some(volume) => {
                let backing = observation
                    .volumes
                    .iter()
                    .find(|v| {
                        v.dataset_id == volume.dataset_id
                            && v.attached_to.as_deref() == Some(observation.instance_id.as_str())
                    })
                    .ok_or_else(|| {
                        anyhow!(
                            "refusing to start {}: dataset {} is not attached here",
                            application.name,
                            volume.dataset_id
                        )
                    })?;
                Some(self.driver.get_device_path(&backing.volume_id).await?)
            }
        };
        self.engine
            .start(application, device_path.as_deref())
            .await?;
        info!(name = %application.name, "container started");
        Ok(())
    }
}
