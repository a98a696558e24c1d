//! Loopback backend: block volumes backed by files under a local directory.
//!
//! Each volume is a JSON metadata document next to a sparse data file. The
//! metadata carries the cluster and dataset tags, so enumeration works from
//! the backend alone and survives restarts. Attaching materialises a
//! per-volume directory that stands in for the OS device node, which keeps
//! the whole lifecycle exercisable without privileges.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::wait::{self, STATUS_ABSENT, STATUS_AVAILABLE, STATUS_IN_USE};
use crate::{allocated_size, BlockDeviceApi, BlockDeviceVolume, VolumeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopbackRecord {
    volume_id: String,
    cluster_id: Uuid,
    dataset_id: Uuid,
    size: u64,
    attached_to: Option<String>,
}

impl LoopbackRecord {
    fn as_volume(&self) -> BlockDeviceVolume {
        BlockDeviceVolume {
            volume_id: self.volume_id.clone(),
            size: self.size,
            attached_to: self.attached_to.clone(),
            dataset_id: self.dataset_id,
        }
    }

    fn status(&self) -> &'static str {
        if self.attached_to.is_some() {
            STATUS_IN_USE
        } else {
            STATUS_AVAILABLE
        }
    }
}

pub struct LoopbackBlockDeviceApi {
    root: PathBuf,
    cluster_id: Uuid,
    instance_id: String,
    deadline: Duration,
}

fn backend_err(err: std::io::Error) -> VolumeError {
    VolumeError::Backend(err.to_string())
}

impl LoopbackBlockDeviceApi {
    pub fn new(root: PathBuf, cluster_id: Uuid, instance_id: impl Into<String>) -> Self {
        LoopbackBlockDeviceApi {
            root,
            cluster_id,
            instance_id: instance_id.into(),
            deadline: wait::DEFAULT_DEADLINE,
        }
    }

    fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    fn record_path(&self, volume_id: &str) -> PathBuf {
        self.volumes_dir().join(format!("{}.json", volume_id))
    }

    fn data_path(&self, volume_id: &str) -> PathBuf {
        self.volumes_dir().join(format!("{}.data", volume_id))
    }

    fn device_dir(&self, volume_id: &str) -> PathBuf {
        self.root.join("devices").join(volume_id)
    }

    async fn read_record(&self, volume_id: &str) -> Result<Option<LoopbackRecord>, VolumeError> {
        match tokio::fs::read(self.record_path(volume_id)).await {
            Ok(bytes) => {
                let record: LoopbackRecord =
                    serde_json::from_slice(&bytes).map_err(|e| VolumeError::Backend(e.to_string()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend_err(e)),
        }
    }

    /// Atomic metadata update: temp file + rename within the directory.
    async fn write_record(&self, record: &LoopbackRecord) -> Result<(), VolumeError> {
        let path = self.record_path(&record.volume_id);
        let tmp = path.with_extension("json.tmp");
        let bytes =
            serde_json::to_vec_pretty(record).map_err(|e| VolumeError::Backend(e.to_string()))?;
        tokio::fs::write(&tmp, bytes).await.map_err(backend_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(backend_err)?;
        Ok(())
    }

    async fn observe(
        &self,
        volume_id: &str,
    ) -> Result<(Option<BlockDeviceVolume>, String), VolumeError> {
        match self.read_record(volume_id).await? {
            Some(record) => Ok((Some(record.as_volume()), record.status().to_string())),
            None => Ok((None, STATUS_ABSENT.to_string())),
        }
    }

    async fn settle(
        &self,
        volume_id: &str,
        expected: &str,
    ) -> Result<Option<BlockDeviceVolume>, VolumeError> {
        wait::wait_for_status(volume_id, expected, self.deadline, || {
            self.observe(volume_id)
        })
        .await
    }
}

#[async_trait]
impl BlockDeviceApi for LoopbackBlockDeviceApi {
    async fn compute_instance_id(&self) -> Result<String, VolumeError> {
        Ok(self.instance_id.clone())
    }

    async fn create_volume(
        &self,
        dataset_id: Uuid,
        size: u64,
    ) -> Result<BlockDeviceVolume, VolumeError> {
        tokio::fs::create_dir_all(self.volumes_dir())
            .await
            .map_err(backend_err)?;

        let volume_id = Uuid::new_v4().to_string();
        let allocated = allocated_size(size);

        let data = tokio::fs::File::create(self.data_path(&volume_id))
            .await
            .map_err(backend_err)?;
        data.set_len(allocated).await.map_err(backend_err)?;

        self.write_record(&LoopbackRecord {
            volume_id: volume_id.clone(),
            cluster_id: self.cluster_id,
            dataset_id,
            size: allocated,
            attached_to: None,
        })
        .await?;

        let created = self.settle(&volume_id, STATUS_AVAILABLE).await?;
        Ok(created.expect("available volume is listed"))
    }

    async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>, VolumeError> {
        let mut volumes = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.volumes_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(volumes),
            Err(e) => return Err(backend_err(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(backend_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(backend_err)?;
            // Unparseable metadata belongs to other software sharing the
            // directory; skip it, as with foreign-cluster volumes.
            let Ok(record) = serde_json::from_slice::<LoopbackRecord>(&bytes) else {
                continue;
            };
            if record.cluster_id == self.cluster_id {
                volumes.push(record.as_volume());
            }
        }
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(volumes)
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<BlockDeviceVolume, VolumeError> {
        let mut record = self
            .read_record(volume_id)
            .await?
            .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))?;
        if record.attached_to.is_some() {
            return Err(VolumeError::AlreadyAttached(volume_id.to_string()));
        }
        record.attached_to = Some(instance_id.to_string());
        self.write_record(&record).await?;
        tokio::fs::create_dir_all(self.device_dir(volume_id))
            .await
            .map_err(backend_err)?;

        let attached = self.settle(volume_id, STATUS_IN_USE).await?;
        Ok(attached.expect("in-use volume is listed"))
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        let mut record = self
            .read_record(volume_id)
            .await?
            .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))?;
        if record.attached_to.is_none() {
            return Err(VolumeError::Unattached(volume_id.to_string()));
        }
        record.attached_to = None;
        self.write_record(&record).await?;
        let _ = tokio::fs::remove_dir_all(self.device_dir(volume_id)).await;

        self.settle(volume_id, STATUS_AVAILABLE).await?;
        Ok(())
    }

    async fn destroy_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        if self.read_record(volume_id).await?.is_none() {
            return Err(VolumeError::UnknownVolume(volume_id.to_string()));
        }
        tokio::fs::remove_file(self.record_path(volume_id))
            .await
            .map_err(backend_err)?;
        let _ = tokio::fs::remove_file(self.data_path(volume_id)).await;
        let _ = tokio::fs::remove_dir_all(self.device_dir(volume_id)).await;

        self.settle(volume_id, STATUS_ABSENT).await?;
        Ok(())
    }

    async fn get_device_path(&self, volume_id: &str) -> Result<PathBuf, VolumeError> {
        let record = self
            .read_record(volume_id)
            .await?
            .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))?;
        if record.attached_to.is_none() {
            return Err(VolumeError::Unattached(volume_id.to_string()));
        }
        Ok(self.device_dir(volume_id))
    }
}

impl std::fmt::Debug for LoopbackBlockDeviceApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBlockDeviceApi")
            .field("root", &self.root)
            .field("cluster_id", &self.cluster_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GIB;
    use std::path::Path;

    fn api(dir: &Path) -> LoopbackBlockDeviceApi {
        LoopbackBlockDeviceApi::new(dir.to_path_buf(), Uuid::new_v4(), "node-1")
    }

    #[tokio::test]
    async fn create_attach_detach_destroy_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());

        let created = api.create_volume(Uuid::new_v4(), 1).await.unwrap();
        assert_eq!(created.size, GIB);
        assert_eq!(created.attached_to, None);

        let attached = api.attach_volume(&created.volume_id, "node-1").await.unwrap();
        assert_eq!(attached.attached_to.as_deref(), Some("node-1"));

        let device = api.get_device_path(&created.volume_id).await.unwrap();
        assert!(device.is_dir());

        api.detach_volume(&created.volume_id).await.unwrap();
        assert!(matches!(
            api.get_device_path(&created.volume_id).await,
            Err(VolumeError::Unattached(_))
        ));

        api.destroy_volume(&created.volume_id).await.unwrap();
        assert!(api.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_filters_foreign_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let ours = api(dir.path());
        let theirs = LoopbackBlockDeviceApi::new(dir.path().to_path_buf(), Uuid::new_v4(), "node-9");

        let dataset_id = Uuid::new_v4();
        ours.create_volume(dataset_id, GIB).await.unwrap();
        theirs.create_volume(Uuid::new_v4(), GIB).await.unwrap();

        let listed = ours.list_volumes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].dataset_id, dataset_id);
    }

    #[tokio::test]
    async fn attach_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());
        let created = api.create_volume(Uuid::new_v4(), GIB).await.unwrap();

        api.attach_volume(&created.volume_id, "node-1").await.unwrap();
        assert!(matches!(
            api.attach_volume(&created.volume_id, "node-2").await,
            Err(VolumeError::AlreadyAttached(_))
        ));
    }

    #[tokio::test]
    async fn operations_on_missing_volume_are_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());

        assert!(matches!(
            api.attach_volume("no-such", "node-1").await,
            Err(VolumeError::UnknownVolume(_))
        ));
        assert!(matches!(
            api.detach_volume("no-such").await,
            Err(VolumeError::UnknownVolume(_))
        ));
        assert!(matches!(
            api.destroy_volume("no-such").await,
            Err(VolumeError::UnknownVolume(_))
        ));
        assert!(matches!(
            api.get_device_path("no-such").await,
            Err(VolumeError::UnknownVolume(_))
        ));
    }

    #[tokio::test]
    async fn detach_unattached_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());
        let created = api.create_volume(Uuid::new_v4(), GIB).await.unwrap();
        assert!(matches!(
            api.detach_volume(&created.volume_id).await,
            Err(VolumeError::Unattached(_))
        ));
    }
}
