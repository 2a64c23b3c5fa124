mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod ws;

use crate::config::ServerConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::services::event_relay::{preload_history, start_event_relay};
use crate::services::instance_lock::InstanceLock;
use crate::services::maintenance::start_maintenance;
use crate::services::schedules::load_schedules;
use crate::state::AppState;
use backup_core::utils::logger;
use backup_core::{BackupManager, Config};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let backup = Config::load(None)?;
    logger::init(&backup.log.level, &backup.log.format)?;

    let config = ServerConfig::from_env()?;
    tracing::info!("Starting backup server on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;

    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    let manager = BackupManager::from_config(&backup);
    manager.init().await?;
    let _lock = InstanceLock::acquire(manager.store().dir())?;

    let state = Arc::new(AppState::new(pool, config.clone(), backup, Arc::new(manager)));

    match preload_history(&state).await {
        Ok(n) => tracing::info!("Loaded {} runs into history", n),
        Err(e) => tracing::warn!("Failed to load run history: {}", e),
    }
    match load_schedules(&state).await {
        Ok(n) => tracing::info!("Loaded {} schedules", n),
        Err(e) => tracing::warn!("Failed to load schedules: {}", e),
    }

    let cancel = CancellationToken::new();
    let relay = start_event_relay(state.clone(), cancel.clone());
    let maintenance = start_maintenance(state.clone(), cancel.clone());
    state.scheduler.start();

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    // Scheduled runs get the grace period; request-scoped ones are cancelled
    state.scheduler.shutdown(config.shutdown_grace).await;
    state.shutdown.cancel();
    let _ = tokio::join!(relay, maintenance);

    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
