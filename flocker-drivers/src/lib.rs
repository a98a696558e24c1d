//! Block-device drivers: a uniform create/attach/detach/destroy/list
//! capability over a storage backend, plus the filesystem-snapshot
//! interface used for dataset handoff.
//!
//! Backend state changes are eventually consistent, so every mutating
//! operation polls the backend's enumeration until the expected steady
//! state is observed (see [`wait`]). Volumes are tagged with the owning
//! cluster id and dataset id at creation, which makes [`list_volumes`]
//! stateless and restart-safe: the backend's metadata is the only record.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod loopback;
pub mod memory;
pub mod snapshots;
pub mod wait;

pub use loopback::LoopbackBlockDeviceApi;
pub use memory::MemoryBlockDeviceApi;

pub const GIB: u64 = 1 << 30;

/// Metadata keys identifying cluster and dataset ownership on a backend
/// volume.
pub const CLUSTER_ID_LABEL: &str = "flocker-cluster-id";
pub const DATASET_ID_LABEL: &str = "flocker-dataset-id";

/// A block volume as seen through the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceVolume {
    pub volume_id: String,
    /// Actual allocated size; may exceed the requested size due to backend
    /// allocation granularity.
    pub size: u64,
    /// Backend instance id of the host the volume is attached to, if any.
    pub attached_to: Option<String>,
    pub dataset_id: Uuid,
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("unknown volume {0}")]
    UnknownVolume(String),
    #[error("volume {0} is already attached")]
    AlreadyAttached(String),
    #[error("volume {0} is not attached")]
    Unattached(String),
    #[error(
        "timed out waiting for volume {volume_id}: expected {expected}, \
         last observed {last_observed} after {waited:?}"
    )]
    Timeout {
        volume_id: String,
        expected: String,
        last_observed: String,
        waited: Duration,
    },
    #[error("volume backend error: {0}")]
    Backend(String),
}

impl VolumeError {
    /// Transient errors are absorbed by the convergence loop and retried on
    /// the next tick; the rest need attention.
    pub fn is_transient(&self) -> bool {
        matches!(self, VolumeError::Timeout { .. } | VolumeError::Backend(_))
    }
}

/// Uniform capability set over a block-storage backend.
#[async_trait]
pub trait BlockDeviceApi: Send + Sync {
    /// Identifier of the current host as known to the backend. Not
    /// necessarily related to the node's IP or UUID.
    async fn compute_instance_id(&self) -> Result<String, VolumeError>;

    /// Allocate storage tagged with the cluster and dataset ids. Returns
    /// once the backend's enumeration reports the volume available; the
    /// returned size is the actual (possibly rounded-up) allocation.
    async fn create_volume(
        &self,
        dataset_id: Uuid,
        size: u64,
    ) -> Result<BlockDeviceVolume, VolumeError>;

    /// Volumes whose metadata carries this cluster's id. Nothing else.
    async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>, VolumeError>;

    /// Attach to an instance; returns once the backend reports the volume
    /// in use.
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<BlockDeviceVolume, VolumeError>;

    /// Inverse of attach; returns once the backend reports the volume
    /// available again.
    async fn detach_volume(&self, volume_id: &str) -> Result<(), VolumeError>;

    /// Issue deletion and return once the enumeration no longer lists the
    /// volume.
    async fn destroy_volume(&self, volume_id: &str) -> Result<(), VolumeError>;

    /// OS path of the device node for the current attachment.
    async fn get_device_path(&self, volume_id: &str) -> Result<PathBuf, VolumeError>;
}

/// Round a requested size up to the backend allocation granularity (1 GiB).
pub fn allocated_size(requested: u64) -> u64 {
    let gib = requested.div_ceil(GIB).max(1);
    gib * GIB
}

/// Build the configured backend. `FLOCKER_VOLUME_BACKEND` selects the
/// implementation; unknown names are an error rather than a silent default.
pub fn driver_from_env(cluster_id: Uuid) -> Result<Arc<dyn BlockDeviceApi>, VolumeError> {
    let backend =
        std::env::var("FLOCKER_VOLUME_BACKEND").unwrap_or_else(|_| "loopback".to_string());
    let instance_id = std::env::var("FLOCKER_INSTANCE_ID")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    match backend.as_str() {
        "loopback" => {
            let root = std::env::var("FLOCKER_LOOPBACK_ROOT")
                .unwrap_or_else(|_| "/var/lib/flocker/loopback".to_string());
            Ok(Arc::new(LoopbackBlockDeviceApi::new(
                PathBuf::from(root),
                cluster_id,
                instance_id,
            )))
        }
        "memory" => Ok(Arc::new(MemoryBlockDeviceApi::new(instance_id, 0))),
        other => Err(VolumeError::Backend(format!(
            "unknown volume backend '{}'",
            other
        ))),
    }
}
