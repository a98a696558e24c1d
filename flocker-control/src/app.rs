use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::config_store::ConfigStore;
use crate::rpc::AgentHub;
use crate::state_store::StateStore;

/// Shared control-service state, injected into the REST handlers and the
/// RPC tasks. No module-level mutable state anywhere.
pub struct AppState {
    pub cluster_id: Uuid,
    pub config: ConfigStore,
    pub state: StateStore,
    pub hub: AgentHub,
    shutting_down: AtomicBool,
}

impl AppState {
    pub fn new(cluster_id: Uuid, config: ConfigStore, state: StateStore) -> Arc<Self> {
        Arc::new(AppState {
            cluster_id,
            config,
            state,
            hub: AgentHub::default(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.hub.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
