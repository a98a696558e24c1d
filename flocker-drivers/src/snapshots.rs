//! Filesystem snapshots, used when handing a dataset from one node to
//! another on snapshot-capable storage.
//!
//! Snapshot names are opaque to the storage layer; our naming scheme
//! encodes the dataset and a sequence number. Listings silently drop names
//! that do not decode under the scheme — those belong to other software
//! sharing the pool.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotName {
    pub dataset_id: Uuid,
    pub sequence: u64,
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flocker_{}_{}", self.dataset_id, self.sequence)
    }
}

impl FromStr for SnapshotName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("flocker_").ok_or(())?;
        let (uuid, seq) = rest.rsplit_once('_').ok_or(())?;
        Ok(SnapshotName {
            dataset_id: Uuid::parse_str(uuid).map_err(|_| ())?,
            sequence: seq.parse().map_err(|_| ())?,
        })
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot command failed (exit {status}): {stderr}")]
    CommandFailed { status: i32, stderr: String },
    #[error("snapshot command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait FilesystemSnapshots: Send + Sync {
    /// Atomically create a named snapshot.
    async fn create(&self, name: &SnapshotName) -> Result<(), SnapshotError>;

    /// Snapshots whose names decode under our scheme, in name order.
    async fn list(&self) -> Result<Vec<SnapshotName>, SnapshotError>;
}

/// ZFS-backed snapshots over an existing pool.
pub struct ZfsSnapshots {
    pool: String,
}

impl ZfsSnapshots {
    pub fn new(pool: impl Into<String>) -> Self {
        ZfsSnapshots { pool: pool.into() }
    }

    async fn zfs(&self, args: &[&str]) -> Result<String, SnapshotError> {
        let mut command = Command::new("zfs");
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
            .await
            .map_err(|_| SnapshotError::TimedOut(COMMAND_TIMEOUT))??;
        if !output.status.success() {
            return Err(SnapshotError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl FilesystemSnapshots for ZfsSnapshots {
    async fn create(&self, name: &SnapshotName) -> Result<(), SnapshotError> {
        let encoded = format!("{}@{}", self.pool, name);
        self.zfs(&["snapshot", &encoded]).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SnapshotName>, SnapshotError> {
        let listing = match self
            .zfs(&[
                "list", "-H", "-r", "-t", "snapshot", "-o", "name", "-s", "name", &self.pool,
            ])
            .await
        {
            Ok(listing) => listing,
            // An absent pool means no datasets are present, not a failure.
            Err(SnapshotError::CommandFailed { stderr, .. })
                if stderr.contains("does not exist") =>
            {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for line in listing.lines() {
            let Some((pool, encoded)) = line.split_once('@') else {
                continue;
            };
            if pool != self.pool {
                continue;
            }
            if let Ok(name) = encoded.parse() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

/// Directory-backed snapshots: one marker file per snapshot. Used with the
/// loopback volume backend and in tests.
pub struct DirectorySnapshots {
    root: PathBuf,
}

impl DirectorySnapshots {
    pub fn new(root: PathBuf) -> Self {
        DirectorySnapshots { root }
    }
}

#[async_trait]
impl FilesystemSnapshots for DirectorySnapshots {
    async fn create(&self, name: &SnapshotName) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name.to_string());
        let tmp = self.root.join(format!(".{}", name));
        tokio::fs::write(&tmp, b"").await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SnapshotName>, SnapshotError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(decoded) = name.parse() {
                    names.push(decoded);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
