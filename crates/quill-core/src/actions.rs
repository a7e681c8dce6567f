use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActionId, SessionId};

/// Well-known action names written to the audit log.
pub mod action {
    pub const EXECUTE_START: &str = "execute_start";
    pub const EXECUTE_COMPLETE: &str = "execute_complete";
    pub const EXECUTE_FAILED: &str = "execute_failed";
    pub const JOB_START: &str = "job_start";
    pub const JOB_FINISH: &str = "job_finish";
    /// One dependency output passed on to the task that consumes it.
    pub const HANDOFF: &str = "handoff";
}

/// One append-only audit record tied to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: ActionId,
    pub session_id: SessionId,
    /// Task name for worker entries, `orchestrator` for job-level entries.
    pub worker: String,
    pub action: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActionLogEntry {
    pub fn new(session_id: &SessionId, worker: &str, action: &str) -> Self {
        Self {
            id: ActionId::new(),
            session_id: session_id.clone(),
            worker: worker.to_string(),
            action: action.to_string(),
            input: None,
            output: None,
            duration_ms: None,
            success: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// True for a successful completion record of a worker task.
    pub fn is_completion(&self) -> bool {
        self.success && self.action == action::EXECUTE_COMPLETE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_sets_fields() {
        let sid = SessionId::new();
        let entry = ActionLogEntry::new(&sid, "research", action::EXECUTE_COMPLETE)
            .with_output(json!({"summary": "ok"}))
            .with_duration_ms(42);
        assert_eq!(entry.session_id, sid);
        assert_eq!(entry.duration_ms, Some(42));
        assert!(entry.success);
        assert!(entry.is_completion());
    }

    #[test]
    fn failed_entry_is_not_completion() {
        let sid = SessionId::new();
        let entry = ActionLogEntry::new(&sid, "post", action::EXECUTE_FAILED).failed("boom");
        assert!(!entry.success);
        assert_eq!(entry.error.as_deref(), Some("boom"));
        assert!(!entry.is_completion());
    }

    #[test]
    fn start_entry_is_not_completion() {
        let entry = ActionLogEntry::new(&SessionId::new(), "post", action::EXECUTE_START);
        assert!(!entry.is_completion());
    }
}
