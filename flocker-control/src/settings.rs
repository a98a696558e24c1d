use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use flocker_common::proto::{DEFAULT_REST_PORT, DEFAULT_RPC_PORT};
use uuid::Uuid;

/// Control-service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub cluster_id: Uuid,
    pub state_dir: PathBuf,
    pub rest_listen: SocketAddr,
    pub rpc_listen: SocketAddr,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub state_ttl: Duration,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}

impl ControlSettings {
    pub fn from_env() -> Result<Self> {
        let cluster_id: Uuid = required("FLOCKER_CLUSTER_ID")?
            .parse()
            .context("FLOCKER_CLUSTER_ID is not a UUID")?;
        let rest_listen = env_or(
            "FLOCKER_REST_LISTEN",
            &format!("0.0.0.0:{}", DEFAULT_REST_PORT),
        )
        .parse()
        .context("FLOCKER_REST_LISTEN is not a socket address")?;
        let rpc_listen = env_or(
            "FLOCKER_RPC_LISTEN",
            &format!("0.0.0.0:{}", DEFAULT_RPC_PORT),
        )
        .parse()
        .context("FLOCKER_RPC_LISTEN is not a socket address")?;
        let state_ttl = env_or("FLOCKER_STATE_TTL_SECS", "60")
            .parse()
            .map(Duration::from_secs)
            .context("FLOCKER_STATE_TTL_SECS is not a number")?;

        Ok(ControlSettings {
            cluster_id,
            state_dir: PathBuf::from(env_or("FLOCKER_STATE_DIR", "/var/lib/flocker")),
            rest_listen,
            rpc_listen,
            ca_file: PathBuf::from(required("FLOCKER_CA_FILE")?),
            cert_file: PathBuf::from(required("FLOCKER_CERT_FILE")?),
            key_file: PathBuf::from(required("FLOCKER_KEY_FILE")?),
            state_ttl,
        })
    }

    pub fn configuration_path(&self) -> PathBuf {
        self.state_dir.join("current_configuration.json")
    }
}
