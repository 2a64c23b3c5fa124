use backup_core::metadata::BackupType;
use backup_core::scheduler::cadence::Cadence;
use backup_core::scheduler::ScheduleEntry;
use rusqlite::{params, Connection, Row};

fn row_to_entry(row: &Row) -> rusqlite::Result<ScheduleEntry> {
    let cadence: String = row.get("cadence")?;
    let backup_type: String = row.get("backup_type")?;
    let enabled: i64 = row.get("enabled")?;
    Ok(ScheduleEntry {
        id: row.get("id")?,
        description: row.get("description")?,
        cadence: serde_json::from_str::<Cadence>(&cadence).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        backup_type: backup_type.parse().unwrap_or(BackupType::Automatic),
        enabled: enabled != 0,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<ScheduleEntry>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_schedules ORDER BY id")?;
    let rows = stmt.query_map([], row_to_entry)?;
    let mut entries = Vec::new();
    for row in rows {
        match row {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!("Skipping unreadable schedule row: {}", e),
        }
    }
    Ok(entries)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<ScheduleEntry>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_schedules WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_entry)?;
    Ok(rows.next().transpose()?)
}

pub fn insert(conn: &Connection, entry: &ScheduleEntry) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_schedules (id, description, cadence, backup_type, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id,
            entry.description,
            serde_json::to_string(&entry.cadence)?,
            entry.backup_type.as_str(),
            entry.enabled as i64,
            now,
            now,
        ],
    )?;
    Ok(())
}

pub fn set_enabled(conn: &Connection, id: &str, enabled: bool) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_schedules SET enabled = ?, updated_at = datetime('now') WHERE id = ?",
        params![enabled as i64, id],
    )?;
    Ok(changes > 0)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_schedules WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
