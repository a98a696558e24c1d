//! In-memory backend for tests and local development.
//!
//! Emulates the asynchronous settling of real cloud volume APIs: with a
//! non-zero `settle_polls`, a requested transition only becomes the
//! steady-state status after that many enumerations, so callers are forced
//! through the same waiting discipline as against a real backend. A
//! single-shot fault can be injected to exercise transient error handling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::wait::{self, STATUS_ABSENT, STATUS_AVAILABLE, STATUS_IN_USE};
use crate::{allocated_size, BlockDeviceApi, BlockDeviceVolume, VolumeError};

#[derive(Debug, Clone)]
enum Transition {
    Create,
    Attach(String),
    Detach,
    Destroy,
}

#[derive(Debug)]
struct Slot {
    volume: BlockDeviceVolume,
    /// A transition still settling, with the number of enumerations left
    /// before it lands.
    pending: Option<(Transition, u32)>,
}

impl Slot {
    fn status(&self) -> String {
        match &self.pending {
            Some((Transition::Create, _)) => "creating".to_string(),
            Some((Transition::Attach(_), _)) => "attaching".to_string(),
            Some((Transition::Detach, _)) => "detaching".to_string(),
            Some((Transition::Destroy, _)) => "deleting".to_string(),
            None if self.volume.attached_to.is_some() => STATUS_IN_USE.to_string(),
            None => STATUS_AVAILABLE.to_string(),
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: BTreeMap<String, Slot>,
    fail_next: Option<String>,
}

pub struct MemoryBlockDeviceApi {
    inner: Mutex<Inner>,
    instance_id: String,
    settle_polls: u32,
    deadline: Duration,
}

impl MemoryBlockDeviceApi {
    pub fn new(instance_id: impl Into<String>, settle_polls: u32) -> Self {
        MemoryBlockDeviceApi {
            inner: Mutex::new(Inner::default()),
            instance_id: instance_id.into(),
            settle_polls,
            deadline: wait::DEFAULT_DEADLINE,
        }
    }

    /// Make the next mutating call fail with a backend error.
    pub async fn fail_next(&self, message: impl Into<String>) {
        self.inner.lock().await.fail_next = Some(message.into());
    }

    /// Drop a volume behind the driver's back, as a cloud operator might.
    pub async fn remove_out_of_band(&self, volume_id: &str) {
        self.inner.lock().await.slots.remove(volume_id);
    }

    async fn take_injected_fault(&self) -> Result<(), VolumeError> {
        if let Some(message) = self.inner.lock().await.fail_next.take() {
            return Err(VolumeError::Backend(message));
        }
        Ok(())
    }

    /// One enumeration step: pending transitions tick toward settled.
    async fn observe(
        &self,
        volume_id: &str,
    ) -> Result<(Option<BlockDeviceVolume>, String), VolumeError> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.slots.get_mut(volume_id) else {
            return Ok((None, STATUS_ABSENT.to_string()));
        };
        if let Some((transition, remaining)) = slot.pending.take() {
            if remaining > 0 {
                slot.pending = Some((transition, remaining - 1));
            } else {
                match transition {
                    Transition::Create => {}
                    Transition::Attach(instance) => slot.volume.attached_to = Some(instance),
                    Transition::Detach => slot.volume.attached_to = None,
                    Transition::Destroy => {
                        inner.slots.remove(volume_id);
                        return Ok((None, STATUS_ABSENT.to_string()));
                    }
                }
            }
        }
        let slot = &inner.slots[volume_id];
        Ok((Some(slot.volume.clone()), slot.status()))
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

    fn pending(&self, transition: Transition) -> Option<(Transition, u32)> {
        Some((transition, self.settle_polls))
    }
}

#[async_trait]
impl BlockDeviceApi for MemoryBlockDeviceApi {
    async fn compute_instance_id(&self) -> Result<String, VolumeError> {
        Ok(self.instance_id.clone())
    }

    async fn create_volume(
        &self,
        dataset_id: Uuid,
        size: u64,
    ) -> Result<BlockDeviceVolume, VolumeError> {
        self.take_injected_fault().await?;
        let volume_id = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock().await;
            inner.slots.insert(
                volume_id.clone(),
                Slot {
                    volume: BlockDeviceVolume {
                        volume_id: volume_id.clone(),
                        size: allocated_size(size),
                        attached_to: None,
                        dataset_id,
                    },
                    pending: self.pending(Transition::Create),
                },
            );
        }
        let created = self.settle(&volume_id, STATUS_AVAILABLE).await?;
        Ok(created.expect("available volume is listed"))
    }

    async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>, VolumeError> {
        let inner = self.inner.lock().await;
        Ok(inner.slots.values().map(|s| s.volume.clone()).collect())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<BlockDeviceVolume, VolumeError> {
        self.take_injected_fault().await?;
        {
            let mut inner = self.inner.lock().await;
            let slot = inner
                .slots
                .get_mut(volume_id)
                .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))?;
            if slot.volume.attached_to.is_some() {
                return Err(VolumeError::AlreadyAttached(volume_id.to_string()));
            }
            slot.pending = self.pending(Transition::Attach(instance_id.to_string()));
        }
        let attached = self.settle(volume_id, STATUS_IN_USE).await?;
        Ok(attached.expect("in-use volume is listed"))
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        self.take_injected_fault().await?;
        {
            let mut inner = self.inner.lock().await;
            let slot = inner
                .slots
                .get_mut(volume_id)
                .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))?;
            if slot.volume.attached_to.is_none() {
                return Err(VolumeError::Unattached(volume_id.to_string()));
            }
            slot.pending = self.pending(Transition::Detach);
        }
        self.settle(volume_id, STATUS_AVAILABLE).await?;
        Ok(())
    }

    async fn destroy_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        self.take_injected_fault().await?;
        {
            let mut inner = self.inner.lock().await;
            let slot = inner
                .slots
                .get_mut(volume_id)
                .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))?;
            slot.pending = self.pending(Transition::Destroy);
        }
        self.settle(volume_id, STATUS_ABSENT).await?;
        Ok(())
    }

    async fn get_device_path(&self, volume_id: &str) -> Result<PathBuf, VolumeError> {
        let inner = self.inner.lock().await;
        let slot = inner
            .slots
            .get(volume_id)
            .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))?;
        if slot.volume.attached_to.is_none() {
            return Err(VolumeError::Unattached(volume_id.to_string()));
        }
        Ok(PathBuf::from(format!("/dev/flocker/{}", volume_id)))
    }
}
