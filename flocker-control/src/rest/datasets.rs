use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use flocker_common::model::{Dataset, Deployment, Manifestation, NodeConfig};
use flocker_common::proto::new_trace_id;

use crate::app::AppState;
use crate::rest::error::ApiError;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/configuration/datasets", post(create_dataset))
        .route(
            "/configuration/datasets/{dataset_id}",
            post(update_dataset).delete(delete_dataset),
        )
}

#[derive(Deserialize)]
pub struct CreateDatasetRequest {
    pub dataset_id: Option<Uuid>,
    /// Node that should hold the primary manifestation.
    pub primary: Uuid,
    pub maximum_size: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub struct UpdateDatasetRequest {
    pub primary: Option<Uuid>,
    pub maximum_size: Option<u64>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
pub struct DatasetConfigResponse {
    pub dataset_id: Uuid,
    pub primary: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_size: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub deleted: bool,
}

impl DatasetConfigResponse {
    fn from_deployment(deployment: &Deployment, dataset_id: Uuid) -> Option<Self> {
        let node = deployment
            .nodes
            .values()
            .find(|node| node.manifestations.contains_key(&dataset_id))?;
        let manifestation = &node.manifestations[&dataset_id];
        Some(DatasetConfigResponse {
            dataset_id,
            primary: node.node_uuid,
            maximum_size: manifestation.dataset.maximum_size,
            metadata: manifestation.dataset.metadata.clone(),
            deleted: manifestation.dataset.deleted,
        })
    }
}

/// Make sure a node entry exists for a placement target, seeding the
/// address from the latest agent report when we have one.
pub(crate) fn ensure_node<'a>(
    deployment: &'a mut Deployment,
    node_uuid: Uuid,
    app: &AppState,
) -> &'a mut NodeConfig {
    deployment.nodes.entry(node_uuid).or_insert_with(|| {
        let address = app
            .state
            .known_nodes()
            .into_iter()
            .find(|(uuid, _)| *uuid == node_uuid)
            .map(|(_, address)| address)
            .unwrap_or_default();
        NodeConfig::new(node_uuid, address)
    })
}

fn guard_shutdown(app: &AppState) -> Result<(), ApiError> {
    if app.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    Ok(())
}

async fn create_dataset(
    State(app): State<Arc<AppState>>,
    Json(request): Json<CreateDatasetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    guard_shutdown(&app)?;
    let trace_id = new_trace_id();
    let dataset_id = request.dataset_id.unwrap_or_else(Uuid::new_v4);

    let mut guard = app.config.lock().await;
    let mut deployment = guard.current().clone();

    if deployment.dataset(&dataset_id).is_some() {
        return Err(ApiError::Conflict(format!(
            "dataset {} already exists",
            dataset_id
        )));
    }

    let node = ensure_node(&mut deployment, request.primary, &app);
    node.manifestations.insert(
        dataset_id,
        Manifestation {
            dataset: Dataset {
                dataset_id,
                maximum_size: request.maximum_size,
                metadata: request.metadata,
                deleted: false,
            },
            primary: true,
        },
    );

    let errors = deployment.validate();
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }
    guard.save(deployment.clone(), &trace_id).await?;
    info!(%trace_id, %dataset_id, primary = %request.primary, "dataset created");

    let body = DatasetConfigResponse::from_deployment(&deployment, dataset_id)
        .ok_or_else(|| ApiError::Internal("dataset vanished after save".to_string()))?;
    Ok((StatusCode::CREATED, Json(body)))
}

async fn update_dataset(
    State(app): State<Arc<AppState>>,
    Path(dataset_id): Path<Uuid>,
    Json(request): Json<UpdateDatasetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    guard_shutdown(&app)?;
    let trace_id = new_trace_id();

    let mut guard = app.config.lock().await;
    let mut deployment = guard.current().clone();

    let holder = deployment
        .nodes
        .values()
        .find(|node| node.manifestations.contains_key(&dataset_id))
        .map(|node| node.node_uuid)
        .ok_or_else(|| ApiError::NotFound(format!("unknown dataset {}", dataset_id)))?;

    let mut manifestation = deployment
        .nodes
        .get_mut(&holder)
        .and_then(|node| node.manifestations.remove(&dataset_id))
        .expect("holder was just located");

    if manifestation.dataset.deleted {
        // Put it back before refusing: tombstones are immutable.
        deployment
            .nodes
            .get_mut(&holder)
            .expect("holder exists")
            .manifestations
            .insert(dataset_id, manifestation);
        return Err(ApiError::Conflict(format!(
            "dataset {} is deleted",
            dataset_id
        )));
    }

    if let Some(size) = request.maximum_size {
        manifestation.dataset.maximum_size = Some(size);
    }
    if let Some(metadata) = request.metadata {
        manifestation.dataset.metadata = metadata;
    }

    let target = request.primary.unwrap_or(holder);
    let node = ensure_node(&mut deployment, target, &app);
    node.manifestations.insert(dataset_id, manifestation);

    let errors = deployment.validate();
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }
    guard.save(deployment.clone(), &trace_id).await?;
    info!(%trace_id, %dataset_id, primary = %target, "dataset updated");

    let body = DatasetConfigResponse::from_deployment(&deployment, dataset_id)
        .ok_or_else(|| ApiError::Internal("dataset vanished after save".to_string()))?;
    Ok((StatusCode::OK, Json(body)))
}

async fn delete_dataset(
    State(app): State<Arc<AppState>>,
    Path(dataset_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    guard_shutdown(&app)?;
    let trace_id = new_trace_id();

    let mut guard = app.config.lock().await;
    let mut deployment = guard.current().clone();

    let manifestation = deployment
        .nodes
        .values_mut()
        .find_map(|node| node.manifestations.get_mut(&dataset_id))
        .ok_or_else(|| ApiError::NotFound(format!("unknown dataset {}", dataset_id)))?;
    manifestation.dataset.deleted = true;

    let errors = deployment.validate();
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }
    guard.save(deployment.clone(), &trace_id).await?;
    info!(%trace_id, %dataset_id, "dataset tombstoned");

    let body = DatasetConfigResponse::from_deployment(&deployment, dataset_id)
        .ok_or_else(|| ApiError::Internal("dataset vanished after save".to_string()))?;
    Ok((StatusCode::OK, Json(body)))
}
