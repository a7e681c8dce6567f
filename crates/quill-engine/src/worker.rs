use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quill_core::actions::{action, ActionLogEntry};
use quill_core::errors::{Classify, ErrorKind, RemoteError};
use quill_core::ids::SessionId;
use quill_store::SessionStore;

use crate::parse::ParseError;

/// What a worker receives: the job topic plus the outputs of the tasks it
/// depends on, keyed by task name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerInput {
    pub topic: String,
    pub deps: BTreeMap<String, Value>,
}

impl WorkerInput {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            deps: BTreeMap::new(),
        }
    }

    pub fn with_dep(mut self, name: impl Into<String>, output: Value) -> Self {
        self.deps.insert(name.into(), output);
        self
    }

    pub fn dep(&self, name: &str) -> Option<&Value> {
        self.deps.get(name)
    }

    /// `topic` is always present; anything else must be a dependency output.
    pub fn has(&self, name: &str) -> bool {
        name == "topic" || self.deps.contains_key(name)
    }

    /// Snapshot written to the action log.
    pub fn to_json(&self) -> Value {
        json!({ "topic": self.topic, "deps": self.deps.keys().collect::<Vec<_>>() })
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl Classify for WorkerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingInput(_) => ErrorKind::InvalidInput,
            Self::Remote(e) => e.kind(),
            Self::Parse(_) => ErrorKind::Parse,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Failed(_) => ErrorKind::Internal,
        }
    }
}

/// A named unit of work producing a JSON output or a failure.
///
/// Workers call the remote dependency through a client that already applies
/// retry and the shared breaker; they never retry on their own.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Input fields that must be present before `run` is called.
    fn required_inputs(&self) -> &[&str] {
        &[]
    }

    async fn run(&self, input: &WorkerInput) -> Result<Value, WorkerError>;
}

/// Worker implementations by name.
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker under its own name, replacing any previous one.
    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Sorted worker names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task context for [`execute_with_logging`].
pub struct ExecutionContext<'a> {
    pub session_id: &'a SessionId,
    pub task: &'a str,
    pub store: &'a dyn SessionStore,
    pub cancel: &'a CancellationToken,
}

/// Append an action log entry, logging instead of failing on store errors.
pub(crate) fn record(store: &dyn SessionStore, entry: &ActionLogEntry) {
    if let Err(e) = store.append_action(entry) {
        warn!(
            session_id = %entry.session_id,
            worker = %entry.worker,
            action = %entry.action,
            error = %e,
            "failed to append action log entry"
        );
    }
}

/// Run one worker with start/complete audit entries around it.
///
/// The start entry is written before input validation and the work, and the
/// completion (or failure) entry after; the worker future is dropped as soon
/// as the cancellation token fires.
pub async fn execute_with_logging(
    worker: &dyn Worker,
    ctx: &ExecutionContext<'_>,
    input: &WorkerInput,
) -> Result<Value, WorkerError> {
    record(
        ctx.store,
        &ActionLogEntry::new(ctx.session_id, ctx.task, action::EXECUTE_START).with_input(input.to_json()),
    );

    let start = Instant::now();
    let result = match missing_input(worker, input) {
        Some(field) => Err(WorkerError::MissingInput(field.to_string())),
        None => {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(WorkerError::Cancelled),
                r = worker.run(input) => r,
            }
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    match &result {
        Ok(output) => {
            debug!(task = ctx.task, duration_ms, "task completed");
            record(
                ctx.store,
                &ActionLogEntry::new(ctx.session_id, ctx.task, action::EXECUTE_COMPLETE)
                    .with_output(output.clone())
                    .with_duration_ms(duration_ms),
            );
        }
        Err(e) => {
            warn!(task = ctx.task, kind = %e.kind(), error = %e, duration_ms, "task failed");
            record(
                ctx.store,
                &ActionLogEntry::new(ctx.session_id, ctx.task, action::EXECUTE_FAILED)
                    .with_duration_ms(duration_ms)
                    .failed(e.to_string()),
            );
        }
    }
    result
}

fn missing_input<'w>(worker: &'w dyn Worker, input: &WorkerInput) -> Option<&'w str> {
    worker
        .required_inputs()
        .iter()
        .copied()
        .find(|field| !input.has(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_store::SqliteSessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoWorker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn name(&self) -> &str {
            "echo"
        }
        fn required_inputs(&self) -> &[&str] {
            &["topic", "research"]
        }
        async fn run(&self, input: &WorkerInput) -> Result<Value, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "echo": input.topic }))
        }
    }

    struct SlowWorker;

    #[async_trait]
    impl Worker for SlowWorker {
        fn name(&self) -> &str {
            "slow"
        }
        async fn run(&self, _input: &WorkerInput) -> Result<Value, WorkerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn echo() -> EchoWorker {
        EchoWorker {
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(echo()));
        registry.register(Arc::new(SlowWorker));
        assert_eq!(registry.count(), 2);
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["echo", "slow"]);
    }

    #[test]
    fn input_reports_topic_and_deps() {
        let input = WorkerInput::new("rust").with_dep("research", json!({"summary": "s"}));
        assert!(input.has("topic"));
        assert!(input.has("research"));
        assert!(!input.has("keywords"));
        assert_eq!(input.to_json()["deps"], json!(["research"]));
    }

    #[tokio::test]
    async fn logs_start_then_complete() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = store.create("rust async").unwrap();
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            session_id: &session.id,
            task: "echo",
            store: &store,
            cancel: &cancel,
        };
        let input = WorkerInput::new("rust async").with_dep("research", json!({}));

        let out = execute_with_logging(&echo(), &ctx, &input).await.unwrap();
        assert_eq!(out["echo"], "rust async");

        let log = store.actions(&session.id).unwrap();
        let actions: Vec<&str> = log.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec![action::EXECUTE_START, action::EXECUTE_COMPLETE]);
        assert!(log[1].is_completion());
        assert!(log[1].duration_ms.is_some());
    }

    #[tokio::test]
    async fn missing_input_fails_without_running() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = store.create("rust async").unwrap();
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            session_id: &session.id,
            task: "echo",
            store: &store,
            cancel: &cancel,
        };
        let worker = echo();

        let err = execute_with_logging(&worker, &ctx, &WorkerInput::new("rust async"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::MissingInput(ref f) if f == "research"));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);

        let log = store.actions(&session.id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].action, action::EXECUTE_FAILED);
        assert!(!log[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_worker() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = store.create("rust async").unwrap();
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            session_id: &session.id,
            task: "slow",
            store: &store,
            cancel: &cancel,
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = execute_with_logging(&SlowWorker, &ctx, &WorkerInput::new("x y z"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
        let log = store.actions(&session.id).unwrap();
        assert_eq!(log.last().unwrap().error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(WorkerError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            WorkerError::Remote(RemoteError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(WorkerError::Parse(ParseError::Empty).kind(), ErrorKind::Parse);
    }
}
