use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version of the persisted configuration document. Documents with a
/// higher version are refused rather than reinterpreted.
pub const CONFIG_VERSION: u32 = 1;

// --- Desired configuration ---

/// A persistent unit of data, identified by a cluster-unique UUID that stays
/// stable across node moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_size: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Tombstone: the operator asked for this dataset to be destroyed.
    /// Agents release the underlying storage once they see it.
    #[serde(default)]
    pub deleted: bool,
}

impl Dataset {
    pub fn new(dataset_id: Uuid) -> Self {
        Dataset {
            dataset_id,
            maximum_size: None,
            metadata: BTreeMap::new(),
            deleted: false,
        }
    }
}

/// The placement of a dataset on a specific node. Exactly one primary
/// manifestation exists per live dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifestation {
    pub dataset: Dataset,
    pub primary: bool,
}

/// Container image reference, `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Image {
    pub repository: String,
    pub tag: String,
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for Image {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("image reference is empty".to_string());
        }
        // A colon only introduces a tag if what follows contains no '/'
        // (registries can carry a port, e.g. registry:5000/app).
        match s.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') && !repository.is_empty() => Ok(Image {
                repository: repository.to_string(),
                tag: tag.to_string(),
            }),
            _ => Ok(Image {
                repository: s.to_string(),
                tag: "latest".to_string(),
            }),
        }
    }
}

/// An exposed port: traffic to `external` on the node reaches `internal` in
/// the container. Externals are node-unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMap {
    pub internal: u16,
    pub external: u16,
}

/// An environment-based link from one application to another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub local_port: u16,
    pub remote_port: u16,
    pub alias: String,
}

/// A dataset materialised onto an application at a mountpoint. The dataset's
/// primary manifestation must live on the same node as the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedVolume {
    pub dataset_id: Uuid,
    pub mountpoint: PathBuf,
}

/// A desired container instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub image: Image,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ports: BTreeSet<PortMap>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub links: BTreeSet<Link>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<AttachedVolume>,
}

/// Desired configuration for a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_uuid: Uuid,
    /// Transport hint only. Node identity is always the UUID.
    pub address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<Application>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manifestations: BTreeMap<Uuid, Manifestation>,
}

impl NodeConfig {
    pub fn new(node_uuid: Uuid, address: impl Into<String>) -> Self {
        NodeConfig {
            node_uuid,
            address: address.into(),
            applications: Vec::new(),
            manifestations: BTreeMap::new(),
        }
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name == name)
    }
}

/// The operator-declared desired state of the whole cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub version: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<Uuid, NodeConfig>,
}

impl Default for Deployment {
    fn default() -> Self {
        Deployment {
            version: CONFIG_VERSION,
            nodes: BTreeMap::new(),
        }
    }
}

impl Deployment {
    pub fn node(&self, node_uuid: &Uuid) -> Option<&NodeConfig> {
        self.nodes.get(node_uuid)
    }

    /// Node holding the desired primary manifestation of a dataset.
    pub fn primary_node(&self, dataset_id: &Uuid) -> Option<Uuid> {
        self.nodes.values().find_map(|node| {
            node.manifestations
                .get(dataset_id)
                .filter(|m| m.primary)
                .map(|_| node.node_uuid)
        })
    }

    /// The dataset as configured, wherever it is placed.
    pub fn dataset(&self, dataset_id: &Uuid) -> Option<&Dataset> {
        self.nodes
            .values()
            .find_map(|node| node.manifestations.get(dataset_id))
            .map(|m| &m.dataset)
    }

    pub fn application_node(&self, name: &str) -> Option<Uuid> {
        self.nodes
            .values()
            .find(|node| node.application(name).is_some())
            .map(|node| node.node_uuid)
    }

    /// Structural invariants, reported as a machine-readable list so the
    /// REST layer can return them verbatim. An empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut primaries: BTreeMap<Uuid, u32> = BTreeMap::new();

        for node in self.nodes.values() {
            let mut names = BTreeSet::new();
            let mut externals = BTreeSet::new();
            for app in &node.applications {
                if !names.insert(app.name.as_str()) {
                    errors.push(format!(
                        "duplicate application name {} on node {}",
                        app.name, node.node_uuid
                    ));
                }
                for port in &app.ports {
                    if !externals.insert(port.external) {
                        errors.push(format!(
                            "duplicate external port {} on node {}",
                            port.external, node.node_uuid
                        ));
                    }
                }
                if let Some(volume) = &app.volume {
                    let local_primary = node
                        .manifestations
                        .get(&volume.dataset_id)
                        .map(|m| m.primary)
                        .unwrap_or(false);
                    if !local_primary {
                        errors.push(format!(
                            "application {} mounts dataset {} whose primary is not on node {}",
                            app.name, volume.dataset_id, node.node_uuid
                        ));
                    }
                    if !volume.mountpoint.is_absolute() {
                        errors.push(format!(
                            "application {} mountpoint {} is not absolute",
                            app.name,
                            volume.mountpoint.display()
                        ));
                    }
                }
            }
            for (dataset_id, manifestation) in &node.manifestations {
                if manifestation.primary && !manifestation.dataset.deleted {
                    *primaries.entry(*dataset_id).or_insert(0) += 1;
                }
                if manifestation.dataset.maximum_size == Some(0) {
                    errors.push(format!("dataset {} has a zero maximum size", dataset_id));
                }
            }
        }

        for (dataset_id, count) in primaries {
            if count > 1 {
                errors.push(format!(
                    "dataset {} has {} primary manifestations",
                    dataset_id, count
                ));
            }
        }

        errors
    }
}

// --- Observed state ---

/// A container as actually found on a node. The application record is the
/// configuration the container was created from; `running` is live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedContainer {
    pub application: Application,
    pub running: bool,
}

/// Everything one agent knows about its own node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_uuid: Uuid,
    pub address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ObservedContainer>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manifestations: BTreeMap<Uuid, Manifestation>,
    /// Filesystem location of each manifest dataset on this node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paths: BTreeMap<Uuid, PathBuf>,
    pub observed_at: DateTime<Utc>,
}

impl NodeState {
    pub fn new(node_uuid: Uuid, address: impl Into<String>) -> Self {
        NodeState {
            node_uuid,
            address: address.into(),
            containers: Vec::new(),
            manifestations: BTreeMap::new(),
            paths: BTreeMap::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn container(&self, name: &str) -> Option<&ObservedContainer> {
        self.containers.iter().find(|c| c.application.name == name)
    }
}

/// Datasets that exist in the cluster's storage backend without being
/// manifest on any node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonManifestDatasets {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<Uuid, Dataset>,
}

/// One unit of state reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateChange {
    Node(NodeState),
    NonManifest(NonManifestDatasets),
}

/// The aggregated observed state of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<Uuid, NodeState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nonmanifest: BTreeMap<Uuid, Dataset>,
}

impl DeploymentState {
    /// Node currently holding the primary manifestation of a dataset.
    pub fn primary_node(&self, dataset_id: &Uuid) -> Option<Uuid> {
        self.nodes.values().find_map(|node| {
            node.manifestations
                .get(dataset_id)
                .filter(|m| m.primary)
                .map(|_| node.node_uuid)
        })
    }

    /// Whether the dataset physically exists anywhere in the cluster.
    pub fn dataset_exists(&self, dataset_id: &Uuid) -> bool {
        self.nonmanifest.contains_key(dataset_id)
            || self
                .nodes
                .values()
                .any(|node| node.manifestations.contains_key(dataset_id))
    }
}
