use crate::models::schedule;
use crate::state::AppState;
use backup_core::scheduler::default_schedules;

/// Register the persisted schedules with the scheduler, seeding the defaults
/// into an empty table when automatic backups are enabled.
pub async fn load_schedules(state: &AppState) -> anyhow::Result<usize> {
    let db = state.db.clone();
    let seed = state
        .config
        .auto_backup_enabled
        .then(|| default_schedules(state.config.auto_backup_time));

    let entries = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let stored = schedule::find_all(&conn)?;
        match seed {
            Some(defaults) if stored.is_empty() => {
                for entry in &defaults {
                    schedule::insert(&conn, entry)?;
                }
                tracing::info!("Seeded {} default schedules", defaults.len());
                Ok::<_, anyhow::Error>(defaults)
            }
            _ => Ok(stored),
        }
    })
    .await??;

    let mut loaded = 0;
    for entry in entries {
        let id = entry.id.clone();
        match state.scheduler.add_schedule(entry) {
            Ok(_) => loaded += 1,
            Err(e) => tracing::warn!(schedule_id = %id, "Skipping schedule: {}", e),
        }
    }
    Ok(loaded)
}
