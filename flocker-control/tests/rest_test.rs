// Integration tests for the operator REST API.

mod common;

use common::{create_test_control, report_node, report_nonmanifest, report_primary};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_create_dataset_and_observe_placement() {
    let control = create_test_control().await;
    let node_a = Uuid::new_v4();
    report_node(&control.app, node_a, "10.0.0.1");

    let response = control
        .server
        .post("/v1/configuration/datasets")
        .json(&json!({
            "primary": node_a,
            "maximum_size": 107374182400u64,
            "metadata": {"name": "postgres-data"}
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    let body: serde_json::Value = response.json();
    assert_eq!(body["primary"], node_a.to_string());
    assert_eq!(body["deleted"], false);
    let dataset_id: Uuid = body["dataset_id"].as_str().unwrap().parse().unwrap();

    // The agent converges and reports the manifestation; the state API then
    // lists the dataset with a non-null path.
    report_primary(&control.app, node_a, dataset_id, "/flocker/data");
    let response = control.server.get("/v1/state/datasets").await;
    assert_eq!(response.status_code(), 200);
    let listed: Vec<serde_json::Value> = response.json();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["dataset_id"], dataset_id.to_string());
    assert_eq!(listed[0]["primary"], node_a.to_string());
    assert_eq!(listed[0]["path"], "/flocker/data");
}

#[tokio::test]
async fn test_move_dataset_updates_primary() {
    let control = create_test_control().await;
    let (node_a, node_b) = (Uuid::new_v4(), Uuid::new_v4());
    report_node(&control.app, node_a, "10.0.0.1");
    report_node(&control.app, node_b, "10.0.0.2");

    let created: serde_json::Value = control
        .server
        .post("/v1/configuration/datasets")
        .json(&json!({"primary": node_a}))
        .await
        .json();
    let dataset_id = created["dataset_id"].as_str().unwrap();

    let response = control
        .server
        .post(&format!("/v1/configuration/datasets/{}", dataset_id))
        .json(&json!({"primary": node_b}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["primary"], node_b.to_string());

    // The desired configuration now has exactly one primary, on B.
    let deployment = control.app.config.get().await;
    let dataset_uuid: Uuid = dataset_id.parse().unwrap();
    assert_eq!(deployment.primary_node(&dataset_uuid), Some(node_b));
}

#[tokio::test]
async fn test_delete_dataset_tombstones() {
    let control = create_test_control().await;
    let node_a = Uuid::new_v4();

    let created: serde_json::Value = control
        .server
        .post("/v1/configuration/datasets")
        .json(&json!({"primary": node_a}))
        .await
        .json();
    let dataset_id = created["dataset_id"].as_str().unwrap();

    let response = control
        .server
        .delete(&format!("/v1/configuration/datasets/{}", dataset_id))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["deleted"], true);

    // Tombstones refuse further edits.
    let response = control
        .server
        .post(&format!("/v1/configuration/datasets/{}", dataset_id))
        .json(&json!({"maximum_size": 1073741824u64}))
        .await;
    assert_eq!(response.status_code(), 409);
}

#[tokio::test]
async fn test_duplicate_external_port_is_schema_error() {
    let control = create_test_control().await;
    let node_a = Uuid::new_v4();

    let response = control
        .server
        .post("/v1/configuration/containers")
        .json(&json!({
            "name": "a",
            "node_uuid": node_a,
            "image": "img",
            "ports": [
                {"internal": 80, "external": 7},
                {"internal": 81, "external": 7}
            ]
        }))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: serde_json::Value = response.json();
    let errors = body["errors"].as_array().unwrap();
    assert!(errors
        .iter()
        .any(|e| e.as_str().unwrap().contains("duplicate external port 7")));

    // Nothing was created.
    let deployment = control.app.config.get().await;
    assert!(deployment.application_node("a").is_none());
}

#[tokio::test]
async fn test_conflicting_dataset_creation_yields_conflict() {
    let control = create_test_control().await;
    let (node_a, node_b) = (Uuid::new_v4(), Uuid::new_v4());
    let dataset_id = Uuid::new_v4();

    let first = control
        .server
        .post("/v1/configuration/datasets")
        .json(&json!({"dataset_id": dataset_id, "primary": node_a}))
        .await;
    assert_eq!(first.status_code(), 201);

    let second = control
        .server
        .post("/v1/configuration/datasets")
        .json(&json!({"dataset_id": dataset_id, "primary": node_b}))
        .await;
    assert_eq!(second.status_code(), 409);

    // Final configuration matches the successful request.
    let deployment = control.app.config.get().await;
    assert_eq!(deployment.primary_node(&dataset_id), Some(node_a));
}

#[tokio::test]
async fn test_container_lifecycle() {
    let control = create_test_control().await;
    let (node_a, node_b) = (Uuid::new_v4(), Uuid::new_v4());

    let response = control
        .server
        .post("/v1/configuration/containers")
        .json(&json!({
            "name": "web",
            "node_uuid": node_a,
            "image": "nginx:1.27",
            "ports": [{"internal": 80, "external": 8080}]
        }))
        .await;
    assert_eq!(response.status_code(), 201);

    // Duplicate names conflict.
    let duplicate = control
        .server
        .post("/v1/configuration/containers")
        .json(&json!({"name": "web", "node_uuid": node_b, "image": "nginx"}))
        .await;
    assert_eq!(duplicate.status_code(), 409);

    let moved = control
        .server
        .post("/v1/configuration/containers/web")
        .json(&json!({"node_uuid": node_b}))
        .await;
    assert_eq!(moved.status_code(), 200);
    let deployment = control.app.config.get().await;
    assert_eq!(deployment.application_node("web"), Some(node_b));

    let removed = control.server.delete("/v1/configuration/containers/web").await;
    assert_eq!(removed.status_code(), 200);
    let deployment = control.app.config.get().await;
    assert!(deployment.application_node("web").is_none());

    let missing = control.server.delete("/v1/configuration/containers/web").await;
    assert_eq!(missing.status_code(), 404);
}

#[tokio::test]
async fn test_stateful_container_move_takes_dataset_along() {
    let control = create_test_control().await;
    let (node_a, node_b) = (Uuid::new_v4(), Uuid::new_v4());
    let dataset_id = Uuid::new_v4();

    let created = control
        .server
        .post("/v1/configuration/datasets")
        .json(&json!({"dataset_id": dataset_id, "primary": node_a}))
        .await;
    assert_eq!(created.status_code(), 201);

    let response = control
        .server
        .post("/v1/configuration/containers")
        .json(&json!({
            "name": "db",
            "node_uuid": node_a,
            "image": "postgres:9.4",
            "volume": {"dataset_id": dataset_id, "mountpoint": "/var/lib/postgresql/data"}
        }))
        .await;
    assert_eq!(response.status_code(), 201);

    let moved = control
        .server
        .post("/v1/configuration/containers/db")
        .json(&json!({"node_uuid": node_b}))
        .await;
    assert_eq!(moved.status_code(), 200);

    let deployment = control.app.config.get().await;
    assert_eq!(deployment.application_node("db"), Some(node_b));
    assert_eq!(deployment.primary_node(&dataset_id), Some(node_b));
}

#[tokio::test]
async fn test_state_endpoints_reflect_agent_reports() {
    let control = create_test_control().await;
    let node_a = Uuid::new_v4();
    report_node(&control.app, node_a, "203.0.113.7");

    let nodes: Vec<serde_json::Value> = control.server.get("/v1/state/nodes").await.json();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["uuid"], node_a.to_string());
    assert_eq!(nodes[0]["host"], "203.0.113.7");

    let containers: Vec<serde_json::Value> =
        control.server.get("/v1/state/containers").await.json();
    assert!(containers.is_empty());
}

#[tokio::test]
async fn test_nonmanifest_datasets_have_no_observed_placement() {
    let control = create_test_control().await;
    let node_a = Uuid::new_v4();
    let manifest = Uuid::new_v4();
    let loose = Uuid::new_v4();
    report_primary(&control.app, node_a, manifest, "/flocker/data");
    report_nonmanifest(&control.app, &[loose]);

    // Only manifest datasets carry a path; non-manifest ones stay out of
    // the placement listing.
    let listed: Vec<serde_json::Value> = control.server.get("/v1/state/datasets").await.json();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["dataset_id"], manifest.to_string());
}

#[tokio::test]
async fn test_mutations_refused_during_shutdown() {
    let control = create_test_control().await;
    control.app.begin_shutdown();

    let response = control
        .server
        .post("/v1/configuration/datasets")
        .json(&json!({"primary": Uuid::new_v4()}))
        .await;
    assert_eq!(response.status_code(), 503);
}
