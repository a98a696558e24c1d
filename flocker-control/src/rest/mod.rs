// REST surface for operators: reads come from the cluster state snapshot,
// mutations go through the configuration store under its mutex.

pub mod containers;
pub mod datasets;
pub mod error;
pub mod state;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::app::AppState;

/// Build the `/v1` application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .merge(state::routes())
        .merge(datasets::routes())
        .merge(containers::routes());
    Router::new()
        .nest("/v1", v1)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
