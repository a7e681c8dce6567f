use quill_core::errors::{Classify, CoreError, ErrorKind};
use quill_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("invalid job plan: {0}")]
    Plan(String),

    #[error("no worker registered for '{0}'")]
    UnknownWorker(String),

    #[error("session {0} is already running")]
    AlreadyRunning(String),

    #[error("{0}")]
    Internal(String),
}

impl Classify for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Core(e) => e.kind(),
            Self::Plan(_) | Self::UnknownWorker(_) => ErrorKind::InvalidInput,
            Self::AlreadyRunning(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
