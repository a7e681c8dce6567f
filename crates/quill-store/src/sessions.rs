use chrono::Utc;
use tracing::instrument;

use quill_core::ids::SessionId;
use quill_core::session::{Session, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, RowReader};

const SESSION_COLUMNS: &str = "id, topic, status, error_message, created_at, completed_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, topic))]
    pub fn create(&self, topic: &str) -> Result<Session, StoreError> {
        let session = Session::new(SessionId::new(), topic);
        let created = row_helpers::format_time(&session.created_at);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, topic, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    session.id.as_str(),
                    session.topic,
                    session.status.to_string(),
                    created,
                    created,
                ],
            )?;
            Ok(())
        })?;
        Ok(session)
    }

    #[instrument(skip_all, fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::SessionNotFound(id.clone())),
            }
        })
    }

    /// Newest first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC, id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Validate and persist a status transition.
    ///
    /// The check and the write share one immediate transaction, so two
    /// concurrent finalisations cannot both succeed.
    #[instrument(skip_all, fields(session_id = %id, status = %status))]
    pub fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<Session, StoreError> {
        self.db.with_tx(|conn| {
            let mut session = {
                let mut stmt = conn
                    .prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
                let mut rows = stmt.query([id.as_str()])?;
                match rows.next()? {
                    Some(row) => row_to_session(row)?,
                    None => return Err(StoreError::SessionNotFound(id.clone())),
                }
            };

            session
                .transition(status, error.map(str::to_string))
                .map_err(|source| StoreError::Rejected {
                    id: id.clone(),
                    source,
                })?;

            conn.execute(
                "UPDATE sessions SET status = ?1, error_message = ?2, completed_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    session.status.to_string(),
                    session.error_message,
                    session.completed_at.as_ref().map(row_helpers::format_time),
                    row_helpers::format_time(&Utc::now()),
                    id.as_str(),
                ],
            )?;
            Ok(session)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let r = RowReader::new(row, "sessions");
    Ok(Session {
        id: SessionId::from_raw(r.value::<String>("id")?),
        topic: r.value("topic")?,
        status: r.parsed("status")?,
        created_at: r.time("created_at")?,
        completed_at: r.time_opt("completed_at")?,
        error_message: r.value("error_message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let created = repo.create("rust async").unwrap();
        assert_eq!(created.status, SessionStatus::Pending);

        let loaded = repo.get(&created.id).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn get_missing_is_not_found() {
        let err = repo().get(&SessionId::from_raw("sess_missing")).unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    #[test]
    fn lifecycle_is_persisted() {
        let repo = repo();
        let s = repo.create("topic one").unwrap();

        let running = repo.update_status(&s.id, SessionStatus::Running, None).unwrap();
        assert_eq!(running.status, SessionStatus::Running);
        assert!(running.completed_at.is_none());

        let failed = repo
            .update_status(&s.id, SessionStatus::Failed, Some("research: timeout"))
            .unwrap();
        let loaded = repo.get(&s.id).unwrap();
        assert_eq!(loaded.status, SessionStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("research: timeout"));
        assert_eq!(loaded.completed_at, failed.completed_at);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn terminal_transition_happens_once() {
        let repo = repo();
        let s = repo.create("topic two").unwrap();
        repo.update_status(&s.id, SessionStatus::Running, None).unwrap();
        repo.update_status(&s.id, SessionStatus::Completed, None).unwrap();

        let err = repo
            .update_status(&s.id, SessionStatus::Failed, Some("late"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
        assert_eq!(repo.get(&s.id).unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn list_newest_first() {
        let repo = repo();
        let a = repo.create("first topic").unwrap();
        let b = repo.create("second topic").unwrap();
        let c = repo.create("third topic").unwrap();

        let listed = repo.list(2).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, c.id);
        assert_eq!(listed[1].id, b.id);
        assert!(repo.list(10).unwrap().iter().any(|s| s.id == a.id));
    }

    #[test]
    fn corrupt_status_is_reported() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let s = repo.create("topic three").unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE sessions SET status = 'exploded' WHERE id = ?1", [s.id.as_str()])?;
            Ok(())
        })
        .unwrap();

        let err = repo.get(&s.id).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "status", .. }));
    }
}
