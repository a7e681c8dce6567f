use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use quill_core::errors::{Classify, ErrorKind};

use crate::worker::WorkerError;

/// Why a task produced no output.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("cancelled before launch")]
    NotLaunched,

    #[error("no worker registered for '{0}'")]
    UnknownWorker(String),
}

impl Classify for TaskFailure {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Worker(e) => e.kind(),
            Self::Panicked(_) => ErrorKind::Internal,
            Self::NotLaunched => ErrorKind::Cancelled,
            Self::UnknownWorker(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Result of one task, as collected at fan-in.
#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub task: String,
    pub worker: String,
    pub essential: bool,
    pub result: Result<Value, TaskFailure>,
    pub elapsed: Duration,
    /// Output reused from an earlier run of the same session.
    pub resumed: bool,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn output(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn summary(&self) -> TaskSummary {
        let (status, error, error_kind) = match &self.result {
            Ok(_) if self.resumed => (TaskStatus::Reused, None, None),
            Ok(_) => (TaskStatus::Succeeded, None, None),
            Err(e) => (TaskStatus::Failed, Some(e.to_string()), Some(e.kind())),
        };
        TaskSummary {
            task: self.task.clone(),
            worker: self.worker.clone(),
            essential: self.essential,
            status,
            error,
            error_kind,
            duration_ms: self.elapsed.as_millis() as u64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Reused,
    Failed,
}

/// Serializable per-task line of a job report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: String,
    pub worker: String,
    pub essential: bool,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

/// `"<task>: <error>"` for every failed essential task, joined with `"; "`.
pub fn essential_failures(outcomes: &[TaskOutcome]) -> Option<String> {
    let failures: Vec<String> = outcomes
        .iter()
        .filter(|o| o.essential)
        .filter_map(|o| o.result.as_ref().err().map(|e| format!("{}: {e}", o.task)))
        .collect();
    (!failures.is_empty()).then(|| failures.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::errors::RemoteError;
    use serde_json::json;

    fn outcome(task: &str, essential: bool, result: Result<Value, TaskFailure>) -> TaskOutcome {
        TaskOutcome {
            task: task.into(),
            worker: task.into(),
            essential,
            result,
            elapsed: Duration::from_millis(12),
            resumed: false,
        }
    }

    #[test]
    fn summary_of_success_and_failure() {
        let ok = outcome("research", true, Ok(json!({})));
        assert_eq!(ok.summary().status, TaskStatus::Succeeded);
        assert_eq!(ok.summary().duration_ms, 12);

        let failed = outcome(
            "post",
            true,
            Err(WorkerError::Remote(RemoteError::Overloaded).into()),
        );
        let s = failed.summary();
        assert_eq!(s.status, TaskStatus::Failed);
        assert_eq!(s.error.as_deref(), Some("provider overloaded"));
        assert_eq!(s.error_kind, Some(ErrorKind::Overloaded));
    }

    #[test]
    fn only_essential_failures_are_summarised() {
        let outcomes = vec![
            outcome("research", true, Err(TaskFailure::Panicked("boom".into()))),
            outcome("keywords", false, Err(TaskFailure::NotLaunched)),
            outcome(
                "post",
                true,
                Err(WorkerError::MissingInput("research".into()).into()),
            ),
            outcome("dialog", false, Ok(json!(null))),
        ];
        assert_eq!(
            essential_failures(&outcomes).as_deref(),
            Some("research: task panicked: boom; post: missing required input: research")
        );
        assert!(essential_failures(&outcomes[3..]).is_none());
    }

    #[test]
    fn summary_serializes_without_empty_error() {
        let json = serde_json::to_value(outcome("research", true, Ok(json!(1))).summary()).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("error").is_none());
    }
}
