use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use flocker_common::model::{Application, AttachedVolume, Image, Link, PortMap};
use flocker_common::proto::new_trace_id;

use crate::app::AppState;
use crate::rest::datasets::ensure_node;
use crate::rest::error::ApiError;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/configuration/containers", post(create_container))
        .route(
            "/configuration/containers/{name}",
            post(move_container).delete(delete_container),
        )
}

#[derive(Deserialize)]
pub struct PortMapBody {
    pub internal: u16,
    pub external: u16,
}

#[derive(Deserialize)]
pub struct LinkBody {
    pub local_port: u16,
    pub remote_port: u16,
    pub alias: String,
}

#[derive(Deserialize)]
pub struct VolumeBody {
    pub dataset_id: Uuid,
    pub mountpoint: PathBuf,
}

#[derive(Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub node_uuid: Uuid,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortMapBody>,
    #[serde(default)]
    pub links: Vec<LinkBody>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub memory_limit: Option<u64>,
    pub cpu_shares: Option<u32>,
    pub volume: Option<VolumeBody>,
}

#[derive(Deserialize)]
pub struct MoveContainerRequest {
    pub node_uuid: Uuid,
}

#[derive(Serialize)]
pub struct ContainerConfigResponse {
    pub name: String,
    pub node_uuid: Uuid,
    pub image: String,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub ports: BTreeSet<PortMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<AttachedVolume>,
}

impl ContainerConfigResponse {
    fn new(node_uuid: Uuid, application: &Application) -> Self {
        ContainerConfigResponse {
            name: application.name.clone(),
            node_uuid,
            image: application.image.to_string(),
            ports: application.ports.clone(),
            volume: application.volume.clone(),
        }
    }
}

fn application_from_request(request: CreateContainerRequest) -> Result<Application, ApiError> {
    let mut errors = Vec::new();
    if request.name.is_empty() {
        errors.push("container name is empty".to_string());
    }
    let image: Image = request
        .image
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;

    let mut ports = BTreeSet::new();
    let mut externals = BTreeSet::new();
    for port in &request.ports {
        if !externals.insert(port.external) {
            errors.push(format!("duplicate external port {}", port.external));
        }
        ports.insert(PortMap {
            internal: port.internal,
            external: port.external,
        });
    }
    let links = request
        .links
        .iter()
        .map(|l| Link {
            local_port: l.local_port,
            remote_port: l.remote_port,
            alias: l.alias.clone(),
        })
        .collect();

    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    Ok(Application {
        name: request.name,
        image,
        ports,
        links,
        environment: request.environment,
        memory_limit: request.memory_limit,
        cpu_shares: request.cpu_shares,
        volume: request.volume.map(|v| AttachedVolume {
            dataset_id: v.dataset_id,
            mountpoint: v.mountpoint,
        }),
    })
}

fn guard_shutdown(app: &AppState) -> Result<(), ApiError> {
    if app.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    Ok(())
}

async fn create_container(
    State(app): State<Arc<AppState>>,
    Json(request): Json<CreateContainerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    guard_shutdown(&app)?;
    let trace_id = new_trace_id();
    let node_uuid = request.node_uuid;
    let application = application_from_request(request)?;

    let mut guard = app.config.lock().await;
    let mut deployment = guard.current().clone();

    if deployment.application_node(&application.name).is_some() {
        return Err(ApiError::Conflict(format!(
            "container {} already exists",
            application.name
        )));
    }

    let node = ensure_node(&mut deployment, node_uuid, &app);
    node.applications.push(application.clone());

    let errors = deployment.validate();
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }
    guard.save(deployment, &trace_id).await?;
    info!(%trace_id, name = %application.name, node = %node_uuid, "container declared");

    Ok((
        StatusCode::CREATED,
        Json(ContainerConfigResponse::new(node_uuid, &application)),
    ))
}

async fn move_container(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<MoveContainerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    guard_shutdown(&app)?;
    let trace_id = new_trace_id();

    let mut guard = app.config.lock().await;
    let mut deployment = guard.current().clone();

    let source = deployment
        .application_node(&name)
        .ok_or_else(|| ApiError::NotFound(format!("unknown container {}", name)))?;

    let source_node = deployment.nodes.get_mut(&source).expect("source exists");
    let position = source_node
        .applications
        .iter()
        .position(|a| a.name == name)
        .expect("application was just located");
    let application = source_node.applications.remove(position);

    // A stateful container takes its dataset's primary along.
    let moved_manifestation = application.volume.as_ref().and_then(|volume| {
        source_node.manifestations.remove(&volume.dataset_id)
    });

    let target = ensure_node(&mut deployment, request.node_uuid, &app);
    if let (Some(volume), Some(manifestation)) = (&application.volume, moved_manifestation) {
        target.manifestations.insert(volume.dataset_id, manifestation);
    }
    target.applications.push(application.clone());

    let errors = deployment.validate();
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }
    guard.save(deployment, &trace_id).await?;
    info!(%trace_id, name = %name, from = %source, to = %request.node_uuid, "container moved");

    Ok((
        StatusCode::OK,
        Json(ContainerConfigResponse::new(request.node_uuid, &application)),
    ))
}

async fn delete_container(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_shutdown(&app)?;
    let trace_id = new_trace_id();

    let mut guard = app.config.lock().await;
    let mut deployment = guard.current().clone();

    let holder = deployment
        .application_node(&name)
        .ok_or_else(|| ApiError::NotFound(format!("unknown container {}", name)))?;
    let node = deployment.nodes.get_mut(&holder).expect("holder exists");
    node.applications.retain(|a| a.name != name);

    let errors = deployment.validate();
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }
    guard.save(deployment, &trace_id).await?;
    info!(%trace_id, name = %name, node = %holder, "container removed");

    Ok((StatusCode::OK, Json(serde_json::json!({ "name": name }))))
}
