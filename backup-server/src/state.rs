use crate::config::ServerConfig;
use crate::db::connection::DbPool;
use crate::ws::ui::UiBroadcaster;
use backup_core::health::HealthMonitor;
use backup_core::scheduler::Scheduler;
use backup_core::{BackupManager, Config};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub db: DbPool,
    pub config: ServerConfig,
    pub backup: Config,
    pub manager: Arc<BackupManager>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthMonitor>,
    pub ui: UiBroadcaster,
    /// Parent of every request-scoped backup and restore
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(db: DbPool, config: ServerConfig, backup: Config, manager: Arc<BackupManager>) -> Self {
        let health = HealthMonitor::new(
            manager.store().clone(),
            manager.history(),
            backup.health.clone(),
        );
        Self {
            db,
            config,
            scheduler: Arc::new(Scheduler::new(manager.clone())),
            health: Arc::new(health),
            manager,
            backup,
            ui: UiBroadcaster::new(),
            shutdown: CancellationToken::new(),
        }
    }
}
