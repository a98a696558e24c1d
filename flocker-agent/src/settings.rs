use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

/// Agent configuration, read once at startup and injected explicitly.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub cluster_id: Uuid,
    pub node_uuid: Uuid,
    pub node_address: String,
    /// `host:port` of the control service RPC endpoint.
    pub control_addr: String,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub convergence_interval: Duration,
    /// ZFS pool for snapshot-based dataset handoff; unset disables it.
    pub zpool: Option<String>,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}

impl AgentSettings {
    pub fn from_env() -> Result<Self> {
        let cluster_id: Uuid = required("FLOCKER_CLUSTER_ID")?
            .parse()
            .context("FLOCKER_CLUSTER_ID is not a UUID")?;
        let node_uuid: Uuid = required("FLOCKER_NODE_UUID")?
            .parse()
            .context("FLOCKER_NODE_UUID is not a UUID")?;
        let convergence_interval = std::env::var("FLOCKER_CONVERGENCE_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map(Duration::from_secs)
            .context("FLOCKER_CONVERGENCE_INTERVAL_SECS is not a number")?;

        Ok(AgentSettings {
            cluster_id,
            node_uuid,
            node_address: required("FLOCKER_NODE_ADDRESS")?,
            control_addr: required("FLOCKER_CONTROL_ADDR")?,
            ca_file: PathBuf::from(required("FLOCKER_CA_FILE")?),
            cert_file: PathBuf::from(required("FLOCKER_CERT_FILE")?),
            key_file: PathBuf::from(required("FLOCKER_KEY_FILE")?),
            convergence_interval,
            zpool: std::env::var("FLOCKER_ZPOOL").ok().filter(|s| !s.is_empty()),
        })
    }
}
