use anyhow::{Context, Result};
use rollcall_core::{Notifier, NullNotifier};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod dbus_interface;
mod engine;
mod notifier;
mod store;

const BUS_NAME: &str = "io.rollcall.Attendance1";
const OBJECT_PATH: &str = "/io/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        embedding_dim = config.embedding_dim,
        bus = ?config.bus,
        operators = ?config.operator_uids,
        "configuration loaded"
    );

    let notifier: Arc<dyn Notifier> = if config.notify_enabled {
        let (outbox, _task) = notifier::spawn_outbox(config.notify_queue);
        Arc::new(outbox)
    } else {
        tracing::info!("notifications disabled via ROLLCALL_NOTIFY_ENABLED=0");
        Arc::new(NullNotifier)
    };

    let engine = engine::spawn_engine(&config, notifier).context("starting engine")?;

    let policy = auth::OperatorPolicy::for_current_user(&config.operator_uids);

    let builder = match config.bus {
        config::BusKind::Session => zbus::connection::Builder::session()?,
        config::BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::AttendanceService::new(engine.clone(), policy))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    engine.shutdown();

    Ok(())
}
