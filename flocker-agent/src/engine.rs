//! Container engine wrapper.
//!
//! The agent drives a local docker daemon through its CLI. Managed
//! containers are namespaced with a name prefix and a label; the
//! application record a container was created from rides along in a second
//! label, so observation reconstructs exactly what was asked for without
//! reverse-engineering runtime flags.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use flocker_common::model::{Application, ObservedContainer};

const NAME_PREFIX: &str = "flocker--";
const MANAGED_LABEL: &str = "flocker.managed=1";
const APPLICATION_LABEL: &str = "flocker.application";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// All managed containers on this node, running or not.
    async fn list(&self) -> Result<Vec<ObservedContainer>>;

    /// Create and start a container for the application. `device_path` is
    /// the materialised dataset to bind at the application's mountpoint.
    async fn start(&self, application: &Application, device_path: Option<&Path>) -> Result<()>;

    /// Stop and remove a managed container. Removing a container that is
    /// already gone is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
}

pub struct DockerEngine;

impl DockerEngine {
    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!(?args, "docker");
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new("docker")
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| anyhow!("docker {:?} timed out after {:?}", args, COMMAND_TIMEOUT))?
        .context("failed to spawn docker")?;

        if !output.status.success() {
            return Err(anyhow!(
                "docker {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Environment injected for a link, mirroring the engine's legacy link
/// variables so linked applications find their peers by alias.
fn link_environment(application: &Application) -> BTreeMap<String, String> {
    let mut environment = BTreeMap::new();
    for link in &application.links {
        let alias = link.alias.to_uppercase().replace('-', "_");
        environment.insert(
            format!("{}_PORT_{}_TCP", alias, link.local_port),
            format!("tcp://{}:{}", link.alias, link.remote_port),
        );
        environment.insert(
            format!("{}_PORT_{}_TCP_PORT", alias, link.local_port),
            link.remote_port.to_string(),
        );
    }
    environment
}

fn run_args(application: &Application, device_path: Option<&Path>) -> Result<Vec<String>> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        format!("{}{}", NAME_PREFIX, application.name),
        "--label".to_string(),
        MANAGED_LABEL.to_string(),
        "--label".to_string(),
        format!(
            "{}={}",
            APPLICATION_LABEL,
            serde_json::to_string(application)?
        ),
    ];
    for port in &application.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.external, port.internal));
    }
    for (key, value) in &application.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in link_environment(application) {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(memory) = application.memory_limit {
        args.push("--memory".to_string());
        args.push(memory.to_string());
    }
    if let Some(shares) = application.cpu_shares {
        args.push("--cpu-shares".to_string());
        args.push(shares.to_string());
    }
    if let Some(volume) = &application.volume {
        let device = device_path
            .ok_or_else(|| anyhow!("application {} needs an attached volume", application.name))?;
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}",
            device.display(),
            volume.mountpoint.display()
        ));
    }
    args.push(application.image.to_string());
    Ok(args)
}

/// Rebuild an observation from one `docker inspect` entry.
fn parse_inspect_entry(entry: &serde_json::Value) -> Option<ObservedContainer> {
    let labels = entry.pointer("/Config/Labels")?;
    let application: Application =
        serde_json::from_str(labels.get(APPLICATION_LABEL)?.as_str()?).ok()?;
    let running = entry
        .pointer("/State/Running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Some(ObservedContainer {
        application,
        running,
    })
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list(&self) -> Result<Vec<ObservedContainer>> {
        let names = self
            .docker(&[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("label={}", MANAGED_LABEL),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ])
            .await?;

        let mut containers = Vec::new();
        for name in names.lines().filter(|l| !l.is_empty()) {
            let inspected = self
                .docker(&["inspect".to_string(), name.to_string()])
                .await?;
            let entries: Vec<serde_json::Value> =
                serde_json::from_str(&inspected).context("unparseable docker inspect output")?;
            for entry in &entries {
                if let Some(container) = parse_inspect_entry(entry) {
                    containers.push(container);
                }
            }
        }
        containers.sort_by(|a, b| a.application.name.cmp(&b.application.name));
        Ok(containers)
    }

    async fn start(&self, application: &Application, device_path: Option<&Path>) -> Result<()> {
        self.docker(&run_args(application, device_path)?).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self
            .docker(&[
                "rm".to_string(),
                "-f".to_string(),
                format!("{}{}", NAME_PREFIX, name),
            ])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory engine for tests: containers appear as started, disappear when
/// removed.
#[derive(Default)]
pub struct FakeEngine {
    containers: tokio::sync::Mutex<BTreeMap<String, ObservedContainer>>,
}

impl FakeEngine {
    /// Seed an existing container, e.g. one left over from a previous
    /// configuration.
    pub async fn seed(&self, application: Application, running: bool) {
        self.containers.lock().await.insert(
            application.name.clone(),
            ObservedContainer {
                application,
                running,
            },
        );
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list(&self) -> Result<Vec<ObservedContainer>> {
        Ok(self.containers.lock().await.values().cloned().collect())
    }

    async fn start(&self, application: &Application, device_path: Option<&Path>) -> Result<()> {
        if application.volume.is_some() && device_path.is_none() {
            return Err(anyhow!(
                "application {} needs an attached volume",
                application.name
            ));
        }
        self.containers.lock().await.insert(
            application.name.clone(),
            ObservedContainer {
                application: application.clone(),
                running: true,
            },
        );
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.containers.lock().await.remove(name);
        Ok(())
    }
}
