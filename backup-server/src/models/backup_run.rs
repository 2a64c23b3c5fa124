use backup_core::history::HistoryItem;
use backup_core::metadata::BackupType;
use rusqlite::{params, Connection, Row};

/// One finished backup run, as persisted.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub id: String,
    pub item: HistoryItem,
    pub error_kind: Option<String>,
}

fn row_to_item(row: &Row) -> rusqlite::Result<HistoryItem> {
    let backup_type: String = row.get("backup_type")?;
    let finished_at: String = row.get("finished_at")?;
    let metadata: Option<String> = row.get("metadata")?;
    let success: i64 = row.get("success")?;
    let duration_ms: i64 = row.get("duration_ms")?;
    let size: i64 = row.get("size")?;
    Ok(HistoryItem {
        timestamp: chrono::DateTime::parse_from_rfc3339(&finished_at)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?,
        schedule_id: row.get("schedule_id")?,
        backup_type: backup_type.parse().unwrap_or(BackupType::Manual),
        filename: row.get("filename")?,
        success: success != 0,
        duration_ms: duration_ms.max(0) as u64,
        size: size.max(0) as u64,
        error: row.get("error")?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

pub fn insert(conn: &Connection, run: &BackupRun) -> anyhow::Result<()> {
    let item = &run.item;
    let metadata = item.metadata.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO backup_runs (id, schedule_id, backup_type, filename, success, duration_ms, size, error, error_kind, metadata, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            run.id,
            item.schedule_id,
            item.backup_type.as_str(),
            item.filename,
            item.success as i64,
            item.duration_ms as i64,
            item.size as i64,
            item.error,
            run.error_kind,
            metadata,
            item.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Most recent runs first.
pub fn find_recent(conn: &Connection, limit: i64) -> anyhow::Result<Vec<HistoryItem>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_runs ORDER BY finished_at DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit], row_to_item)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_memory_pool;
    use crate::db::migrate::migrate;
    use chrono::{Duration, Utc};

    fn run(id: &str, minutes_ago: i64, success: bool) -> BackupRun {
        BackupRun {
            id: id.to_string(),
            item: HistoryItem {
                timestamp: Utc::now() - Duration::minutes(minutes_ago),
                schedule_id: Some("daily".into()),
                backup_type: BackupType::Automatic,
                filename: success.then(|| format!("{id}.sql.gz")),
                success,
                duration_ms: 1200,
                size: if success { 4096 } else { 0 },
                error: (!success).then(|| "connection refused".to_string()),
                metadata: None,
            },
            error_kind: (!success).then(|| "transient_io".to_string()),
        }
    }

    #[test]
    fn test_runs_newest_first() {
        let pool = create_memory_pool();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        insert(&conn, &run("a", 30, true)).unwrap();
        insert(&conn, &run("b", 10, false)).unwrap();
        insert(&conn, &run("c", 20, true)).unwrap();

        let items = find_recent(&conn, 2).unwrap();
        assert_eq!(items.len(), 2);
        assert!(!items[0].success);
        assert_eq!(items[0].error.as_deref(), Some("connection refused"));
        assert_eq!(items[1].filename.as_deref(), Some("c.sql.gz"));
        assert_eq!(items[1].size, 4096);
    }
}
