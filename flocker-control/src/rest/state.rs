use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::app::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/state/datasets", get(list_datasets))
        .route("/state/containers", get(list_containers))
        .route("/state/nodes", get(list_nodes))
}

#[derive(Serialize)]
pub struct DatasetStateResponse {
    pub dataset_id: Uuid,
    pub primary: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_size: Option<u64>,
    pub path: PathBuf,
}

async fn list_datasets(State(state): State<Arc<AppState>>) -> Json<Vec<DatasetStateResponse>> {
    let snapshot = state.state.as_deployment();
    let mut datasets = Vec::new();
    for node in snapshot.nodes.values() {
        for (dataset_id, manifestation) in &node.manifestations {
            if !manifestation.primary {
                continue;
            }
            let Some(path) = node.paths.get(dataset_id) else {
                continue;
            };
            datasets.push(DatasetStateResponse {
                dataset_id: *dataset_id,
                primary: node.node_uuid,
                maximum_size: manifestation.dataset.maximum_size,
                path: path.clone(),
            });
        }
    }
    datasets.sort_by_key(|d| d.dataset_id);
    Json(datasets)
}

#[derive(Serialize)]
pub struct ContainerStateResponse {
    pub name: String,
    pub node_uuid: Uuid,
    pub image: String,
    pub running: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<u16, u16>,
}

async fn list_containers(State(state): State<Arc<AppState>>) -> Json<Vec<ContainerStateResponse>> {
    let snapshot = state.state.as_deployment();
    let mut containers = Vec::new();
    for node in snapshot.nodes.values() {
        for observed in &node.containers {
            containers.push(ContainerStateResponse {
                name: observed.application.name.clone(),
                node_uuid: node.node_uuid,
                image: observed.application.image.to_string(),
                running: observed.running,
                ports: observed
                    .application
                    .ports
                    .iter()
                    .map(|p| (p.external, p.internal))
                    .collect(),
            });
        }
    }
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    Json(containers)
}

#[derive(Serialize)]
pub struct NodeResponse {
    pub uuid: Uuid,
    pub host: String,
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeResponse>> {
    let mut nodes: Vec<_> = state
        .state
        .known_nodes()
        .into_iter()
        .map(|(uuid, host)| NodeResponse { uuid, host })
        .collect();
    nodes.sort_by_key(|n| n.uuid);
    Json(nodes)
}
