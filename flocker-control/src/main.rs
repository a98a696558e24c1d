use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use flocker_common::tls;
use flocker_control::config_store::ConfigStore;
use flocker_control::settings::ControlSettings;
use flocker_control::state_store::StateStore;
use flocker_control::{rest, rpc, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = ControlSettings::from_env()?;
    tokio::fs::create_dir_all(&settings.state_dir).await?;

    let config = ConfigStore::load_or_default(settings.configuration_path()).await?;
    let state = StateStore::new(settings.state_ttl);
    let app = AppState::new(settings.cluster_id, config, state);

    let server_tls = Arc::new(tls::server_config(
        &settings.ca_file,
        &settings.cert_file,
        &settings.key_file,
    )?);

    // Agent RPC listener.
    let rpc_listener = TcpListener::bind(settings.rpc_listen).await?;
    info!(addr = %settings.rpc_listen, "agent RPC listening");
    tokio::spawn(rpc::run(
        rpc_listener,
        TlsAcceptor::from(server_tls.clone()),
        app.clone(),
    ));

    // Rebroadcast on configuration changes.
    tokio::spawn(rpc::watch_configuration(app.clone()));

    // Tear down agent sessions on shutdown; in-flight REST mutations get 503.
    let shutdown_app = app.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to install signal handler");
            return;
        }
        info!("shutting down: closing agent sessions");
        shutdown_app.begin_shutdown();
        // Give in-flight requests a moment to observe the 503 state.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        std::process::exit(0);
    });

    // Operator REST listener (mutual TLS as well).
    let router = rest::create_router(app);
    info!(addr = %settings.rest_listen, cluster = %settings.cluster_id, "REST API listening");
    axum_server::bind_rustls(settings.rest_listen, RustlsConfig::from_config(server_tls))
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
