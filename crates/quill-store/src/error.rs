use std::path::PathBuf;

use quill_core::errors::{Classify, CoreError, ErrorKind};
use quill_core::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// A status write the session state machine refused.
    #[error("session {id}: {source}")]
    Rejected {
        id: SessionId,
        #[source]
        source: CoreError,
    },

    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("schema migration {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("cannot encode {field} as JSON: {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) => ErrorKind::InvalidInput,
            Self::Rejected { source, .. } => source.kind(),
            _ => ErrorKind::Storage,
        }
    }
}
