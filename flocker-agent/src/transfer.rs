//! Snapshot streaming between nodes for dataset handoff.
//!
//! Streams run over `ssh`, authenticated by host keys issued from the
//! cluster CA at provisioning time. The sending side pipes `zfs send` into
//! the peer's `zfs recv`; receiving pulls the other way around. Block
//! backends never get here: for them a move is detach-then-attach against
//! the shared backend.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;

use flocker_drivers::snapshots::SnapshotName;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

async fn run_pipeline(pipeline: String) -> Result<()> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&pipeline)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let output = tokio::time::timeout(TRANSFER_TIMEOUT, command.output())
        .await
        .map_err(|_| anyhow!("snapshot transfer timed out after {:?}", TRANSFER_TIMEOUT))?
        .context("failed to spawn snapshot transfer")?;
    if !output.status.success() {
        return Err(anyhow!(
            "snapshot transfer failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Push a snapshot of the local pool to the node taking over the dataset.
pub async fn push_snapshot(pool: &str, name: &SnapshotName, peer: &str) -> Result<()> {
    run_pipeline(format!(
        "zfs send {pool}@{name} | ssh {peer} zfs recv -F {pool}",
        pool = pool,
        name = name,
        peer = peer,
    ))
    .await
}

/// Pull the latest snapshot stream from the node currently holding the
/// dataset.
pub async fn pull_snapshot(pool: &str, name: &SnapshotName, peer: &str) -> Result<()> {
    run_pipeline(format!(
        "ssh {peer} zfs send {pool}@{name} | zfs recv -F {pool}",
        pool = pool,
        name = name,
        peer = peer,
    ))
    .await
}
