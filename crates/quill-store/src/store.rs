use quill_core::actions::ActionLogEntry;
use quill_core::ids::SessionId;
use quill_core::session::{Session, SessionStatus};

use crate::actions::ActionRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::sessions::SessionRepo;

/// Durable record of sessions and their action logs.
///
/// Calls are short and synchronous; implementations serialise access
/// internally and are shared across jobs behind an `Arc`.
pub trait SessionStore: Send + Sync {
    /// Create a new `Pending` session.
    fn create(&self, topic: &str) -> Result<Session, StoreError>;

    fn load(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Persist a status transition. Invalid transitions are `Rejected`.
    fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<Session, StoreError>;

    fn append_action(&self, entry: &ActionLogEntry) -> Result<(), StoreError>;

    /// Entries in append order.
    fn actions(&self, id: &SessionId) -> Result<Vec<ActionLogEntry>, StoreError>;

    /// Newest first.
    fn list(&self, limit: u32) -> Result<Vec<Session>, StoreError>;
}

pub struct SqliteSessionStore {
    sessions: SessionRepo,
    actions: ActionRepo,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            actions: ActionRepo::new(db),
        }
    }

    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }
}

impl SessionStore for SqliteSessionStore {
    fn create(&self, topic: &str) -> Result<Session, StoreError> {
        self.sessions.create(topic)
    }

    fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions.get(id)
    }

    fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<Session, StoreError> {
        self.sessions.update_status(id, status, error)
    }

    fn append_action(&self, entry: &ActionLogEntry) -> Result<(), StoreError> {
        self.actions.append(entry)
    }

    fn actions(&self, id: &SessionId) -> Result<Vec<ActionLogEntry>, StoreError> {
        self.actions.list(id)
    }

    fn list(&self, limit: u32) -> Result<Vec<Session>, StoreError> {
        self.sessions.list(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::actions::action;
    use std::sync::Arc;

    #[test]
    fn store_through_trait_object() {
        let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::in_memory().unwrap());
        let s = store.create("rust async").unwrap();
        store.update_status(&s.id, SessionStatus::Running, None).unwrap();
        store
            .append_action(&ActionLogEntry::new(&s.id, "research", action::EXECUTE_START))
            .unwrap();
        store.update_status(&s.id, SessionStatus::Completed, None).unwrap();

        let loaded = store.load(&s.id).unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(store.actions(&s.id).unwrap().len(), 1);
        assert_eq!(store.list(10).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_appends_from_threads() {
        let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
        let s = store.create("parallel topic").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                let sid = s.id.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let worker = format!("worker-{i}");
                        store
                            .append_action(&ActionLogEntry::new(&sid, &worker, action::EXECUTE_START))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.actions(&s.id).unwrap().len(), 40);
    }
}
