//! Durable, versioned holder of the desired [`Deployment`].
//!
//! A single JSON document, replaced atomically (temp file + rename in the
//! same directory), so a partially-written store is never observable. The
//! in-memory value only advances after the rename succeeds; a failed save
//! leaves the previous committed value in place and surfaces the error.
//! Subscribers learn about committed changes through a watch channel
//! carrying the change epoch and the trace id of the inducing mutation.

use std::path::PathBuf;

use flocker_common::model::{Deployment, CONFIG_VERSION};
use flocker_common::wire::{self, WireError};
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("refusing to save configuration version {saved} over committed version {current}")]
    VersionRegression { saved: u32, current: u32 },
    #[error("persisted configuration has version {found}, this build supports up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("configuration io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
pub struct ConfigEpoch {
    pub epoch: u64,
    pub trace_id: String,
}

struct Inner {
    current: Deployment,
    epoch: u64,
}

pub struct ConfigStore {
    inner: Mutex<Inner>,
    path: PathBuf,
    tx: watch::Sender<ConfigEpoch>,
}

impl ConfigStore {
    /// Load the committed document, or start from an empty deployment when
    /// none exists yet. A document written by a newer schema is refused.
    pub async fn load_or_default(path: PathBuf) -> Result<Self, ConfigError> {
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let deployment: Deployment = wire::decode(&bytes)?;
                if deployment.version > CONFIG_VERSION {
                    return Err(ConfigError::UnsupportedVersion {
                        found: deployment.version,
                        supported: CONFIG_VERSION,
                    });
                }
                deployment
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Deployment::default(),
            Err(e) => return Err(e.into()),
        };

        let (tx, _) = watch::channel(ConfigEpoch {
            epoch: 0,
            trace_id: String::new(),
        });
        Ok(ConfigStore {
            inner: Mutex::new(Inner { current, epoch: 0 }),
            path,
            tx,
        })
    }

    pub async fn get(&self) -> Deployment {
        self.inner.lock().await.current.clone()
    }

    /// Take the store's mutex for a load-transform-save sequence. REST
    /// mutations hold this guard across the whole transaction so concurrent
    /// writers serialize.
    pub async fn lock(&self) -> ConfigGuard<'_> {
        ConfigGuard {
            inner: self.inner.lock().await,
            path: &self.path,
            tx: &self.tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigEpoch> {
        self.tx.subscribe()
    }
}

pub struct ConfigGuard<'a> {
    inner: MutexGuard<'a, Inner>,
    path: &'a PathBuf,
    tx: &'a watch::Sender<ConfigEpoch>,
}

impl ConfigGuard<'_> {
    pub fn current(&self) -> &Deployment {
        &self.inner.current
    }

    /// Persist a new deployment. Returns only once the document is durable;
    /// every subscriber is then notified with `trace_id`.
    pub async fn save(&mut self, deployment: Deployment, trace_id: &str) -> Result<(), ConfigError> {
        if deployment.version < self.inner.current.version {
            return Err(ConfigError::VersionRegression {
                saved: deployment.version,
                current: self.inner.current.version,
            });
        }

        let bytes = wire::encode(&deployment)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, self.path).await?;

        self.inner.current = deployment;
        self.inner.epoch += 1;
        self.tx.send_replace(ConfigEpoch {
            epoch: self.inner.epoch,
            trace_id: trace_id.to_string(),
        });
        Ok(())
    }
}
