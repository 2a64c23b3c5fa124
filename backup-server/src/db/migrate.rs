use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_schedules (
  id TEXT PRIMARY KEY,
  description TEXT NOT NULL DEFAULT '',
  cadence TEXT NOT NULL,
  backup_type TEXT NOT NULL DEFAULT 'automatic' CHECK(backup_type IN ('manual','automatic','migration','safety')),
  enabled INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS backup_runs (
  id TEXT PRIMARY KEY,
  schedule_id TEXT,
  backup_type TEXT NOT NULL,
  filename TEXT,
  success INTEGER NOT NULL,
  duration_ms INTEGER NOT NULL DEFAULT 0,
  size INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  error_kind TEXT,
  metadata TEXT,
  finished_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_runs_finished_at ON backup_runs(finished_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_runs_schedule_id ON backup_runs(schedule_id);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    let columns: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(backup_runs)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        rows.filter_map(|r| r.ok()).collect()
    };
    if !columns.iter().any(|c| c == "error_kind") {
        conn.execute_batch("ALTER TABLE backup_runs ADD COLUMN error_kind TEXT")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
