use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::FromSql;
use rusqlite::Row;
use serde_json::Value;

use crate::error::StoreError;

/// Reads columns of one row by name. Every decode failure becomes a
/// `CorruptRow` naming the table and column.
pub struct RowReader<'a, 'stmt> {
    row: &'a Row<'stmt>,
    table: &'static str,
}

impl<'a, 'stmt> RowReader<'a, 'stmt> {
    pub fn new(row: &'a Row<'stmt>, table: &'static str) -> Self {
        Self { row, table }
    }

    fn corrupt(&self, column: &'static str, detail: impl Into<String>) -> StoreError {
        StoreError::CorruptRow {
            table: self.table,
            column,
            detail: detail.into(),
        }
    }

    /// A column as stored; use `Option<T>` for nullable columns.
    pub fn value<T: FromSql>(&self, column: &'static str) -> Result<T, StoreError> {
        self.row
            .get(column)
            .map_err(|e| self.corrupt(column, e.to_string()))
    }

    /// A text column parsed through `FromStr` (status enums).
    pub fn parsed<T: FromStr>(&self, column: &'static str) -> Result<T, StoreError> {
        let raw: String = self.value(column)?;
        raw.parse()
            .map_err(|_| self.corrupt(column, format!("unknown value {raw:?}")))
    }

    /// A nullable JSON text column.
    pub fn json(&self, column: &'static str) -> Result<Option<Value>, StoreError> {
        self.value::<Option<String>>(column)?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| self.corrupt(column, format!("invalid JSON: {e}")))
            })
            .transpose()
    }

    pub fn time(&self, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
        let raw: String = self.value(column)?;
        self.decode_time(column, &raw)
    }

    pub fn time_opt(&self, column: &'static str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.value::<Option<String>>(column)?
            .map(|raw| self.decode_time(column, &raw))
            .transpose()
    }

    fn decode_time(&self, column: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| self.corrupt(column, format!("invalid timestamp {raw:?}: {e}")))
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::session::SessionStatus;
    use rusqlite::Connection;

    /// Evaluate `select` (one row) and hand its reader to `f`.
    fn read<T>(select: &str, f: impl FnOnce(&RowReader<'_, '_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn.prepare(select).unwrap();
        let mut rows = stmt.query([]).unwrap();
        let row = rows.next().unwrap().unwrap();
        f(&RowReader::new(row, "t"))
    }

    #[test]
    fn parsed_status() {
        let status: SessionStatus = read("SELECT 'running' AS status", |r| r.parsed("status")).unwrap();
        assert_eq!(status, SessionStatus::Running);

        let err = read("SELECT 'sleeping' AS status", |r| r.parsed::<SessionStatus>("status")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { table: "t", column: "status", .. }));
    }

    #[test]
    fn json_column() {
        let v = read(r#"SELECT '{"a":1}' AS output"#, |r| r.json("output")).unwrap();
        assert_eq!(v.unwrap()["a"], 1);
        assert!(read("SELECT NULL AS output", |r| r.json("output")).unwrap().is_none());
        assert!(matches!(
            read("SELECT 'nope' AS output", |r| r.json("output")),
            Err(StoreError::CorruptRow { column: "output", .. })
        ));
    }

    #[test]
    fn missing_column_is_corrupt() {
        let err = read("SELECT 1 AS a", |r| r.value::<i64>("b")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "b", .. }));
    }

    #[test]
    fn time_round_trip() {
        let now = Utc::now();
        let select = format!("SELECT '{}' AS at, NULL AS done", format_time(&now));
        let (at, done) = read(&select, |r| Ok((r.time("at")?, r.time_opt("done")?))).unwrap();
        assert_eq!(at, now);
        assert!(done.is_none());
        assert!(read("SELECT 'yesterday' AS at", |r| r.time("at")).is_err());
    }

    #[test]
    fn formatted_times_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:01Z").unwrap().with_timezone(&Utc);
        assert!(format_time(&early) < format_time(&late));
    }
}
