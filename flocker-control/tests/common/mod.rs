// Common test utilities: an in-process control service with a throwaway
// state directory, no TLS (the router is exercised directly).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use uuid::Uuid;

use flocker_common::model::{
    Dataset, Manifestation, NodeState, NonManifestDatasets, StateChange,
};
use flocker_control::config_store::ConfigStore;
use flocker_control::rest::create_router;
use flocker_control::state_store::StateStore;
use flocker_control::AppState;

pub struct TestControl {
    pub server: TestServer,
    pub app: Arc<AppState>,
    // Keeps the state directory alive for the duration of the test.
    _dir: tempfile::TempDir,
}

pub async fn create_test_control() -> TestControl {
    let dir = tempfile::tempdir().expect("create state dir");
    let config = ConfigStore::load_or_default(dir.path().join("current_configuration.json"))
        .await
        .expect("create config store");
    let state = StateStore::new(Duration::from_secs(60));
    let app = AppState::new(Uuid::new_v4(), config, state);
    let server = TestServer::new(create_router(app.clone())).expect("create test server");
    TestControl {
        server,
        app,
        _dir: dir,
    }
}

/// Report a minimal healthy agent for `node_uuid`.
pub fn report_node(app: &AppState, node_uuid: Uuid, address: &str) {
    app.state
        .apply_changes(vec![StateChange::Node(NodeState::new(node_uuid, address))]);
}

/// Report a node that manifests `dataset_id` as primary at `path`.
pub fn report_primary(app: &AppState, node_uuid: Uuid, dataset_id: Uuid, path: &str) {
    let mut state = NodeState::new(node_uuid, "10.0.0.1");
    state.manifestations.insert(
        dataset_id,
        Manifestation {
            dataset: Dataset::new(dataset_id),
            primary: true,
        },
    );
    state.paths.insert(dataset_id, PathBuf::from(path));
    app.state.apply_changes(vec![StateChange::Node(state)]);
}

/// Report the cluster-wide non-manifest dataset set.
pub fn report_nonmanifest(app: &AppState, dataset_ids: &[Uuid]) {
    let datasets: BTreeMap<_, _> = dataset_ids
        .iter()
        .map(|id| (*id, Dataset::new(*id)))
        .collect();
    app.state
        .apply_changes(vec![StateChange::NonManifest(NonManifestDatasets {
            datasets,
        })]);
}
