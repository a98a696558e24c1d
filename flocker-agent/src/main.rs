use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use flocker_agent::connection::{self, ControlConnector};
use flocker_agent::convergence::ConvergenceLoop;
use flocker_agent::engine::DockerEngine;
use flocker_agent::executor::Executor;
use flocker_agent::observer::Observer;
use flocker_agent::settings::AgentSettings;
use flocker_common::tls;
use flocker_drivers::driver_from_env;
use flocker_drivers::snapshots::{FilesystemSnapshots, ZfsSnapshots};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = AgentSettings::from_env()?;
    info!(
        node = %settings.node_uuid,
        cluster = %settings.cluster_id,
        control = %settings.control_addr,
        "convergence agent starting"
    );

    let driver = driver_from_env(settings.cluster_id)?;
    let engine = Arc::new(DockerEngine);
    let snapshots: Option<Arc<dyn FilesystemSnapshots>> = settings
        .zpool
        .as_ref()
        .map(|pool| Arc::new(ZfsSnapshots::new(pool.clone())) as Arc<dyn FilesystemSnapshots>);

    let observer = Observer::new(
        settings.node_uuid,
        settings.node_address.clone(),
        engine.clone(),
        driver.clone(),
    );
    let executor = Executor::new(engine, driver, snapshots, settings.zpool.clone());

    let client_tls = Arc::new(tls::client_config(
        &settings.ca_file,
        &settings.cert_file,
        &settings.key_file,
    )?);
    let connector = ControlConnector::new(settings.control_addr.clone(), client_tls)?;

    let (updates_tx, updates_rx) = mpsc::channel(16);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let convergence = ConvergenceLoop::new(
        observer,
        executor,
        updates_rx,
        outbound_tx,
        settings.convergence_interval,
    );
    tokio::spawn(convergence.run());

    // Runs until a fatal protocol mismatch; the supervisor restarts us.
    connection::run(connector, updates_tx, outbound_rx).await
}
