use tracing::instrument;

use quill_core::actions::ActionLogEntry;
use quill_core::ids::{ActionId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, RowReader};

/// Append-only audit log. Rows are never updated or deleted.
pub struct ActionRepo {
    db: Database,
}

impl ActionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(session_id = %entry.session_id, worker = %entry.worker, action = %entry.action))]
    pub fn append(&self, entry: &ActionLogEntry) -> Result<(), StoreError> {
        let input = encode("input", entry.input.as_ref())?;
        let output = encode("output", entry.output.as_ref())?;
        let duration = entry
            .duration_ms
            .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX));

        self.db.with_tx(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                [entry.session_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::SessionNotFound(entry.session_id.clone()));
            }

            conn.execute(
                "INSERT INTO action_log (id, session_id, worker, action, input, output, duration_ms, success, error, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    entry.id.as_str(),
                    entry.session_id.as_str(),
                    entry.worker,
                    entry.action,
                    input,
                    output,
                    duration,
                    entry.success,
                    entry.error,
                    row_helpers::format_time(&entry.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    /// All entries for a session in append order.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<ActionLogEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, worker, action, input, output, duration_ms, success, error, timestamp
                 FROM action_log WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(row_to_entry(row)?);
            }
            Ok(entries)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM action_log WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ActionLogEntry, StoreError> {
    let r = RowReader::new(row, "action_log");
    Ok(ActionLogEntry {
        id: ActionId::from_raw(r.value::<String>("id")?),
        session_id: SessionId::from_raw(r.value::<String>("session_id")?),
        worker: r.value("worker")?,
        action: r.value("action")?,
        input: r.json("input")?,
        output: r.json("output")?,
        duration_ms: r.value::<Option<i64>>("duration_ms")?.map(|ms| ms.max(0) as u64),
        success: r.value("success")?,
        error: r.value("error")?,
        timestamp: r.time("timestamp")?,
    })
}

fn encode(field: &'static str, value: Option<&serde_json::Value>) -> Result<Option<String>, StoreError> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(|source| StoreError::Encode { field, source })
}
