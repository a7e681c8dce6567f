use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Span};

use quill_core::actions::{action, ActionLogEntry};
use quill_core::ids::SessionId;
use quill_core::session::{Session, SessionStatus};
use quill_core::validate::validate_topic;
use quill_store::SessionStore;
use quill_telemetry::{names, MetricsRecorder};

use crate::error::EngineError;
use crate::outcome::{essential_failures, TaskFailure, TaskOutcome, TaskStatus, TaskSummary};
use crate::plan::{JobPlan, TaskSpec};
use crate::worker::{execute_with_logging, record, ExecutionContext, Worker, WorkerInput, WorkerRegistry};

const ORCHESTRATOR: &str = "orchestrator";

/// Aggregate result of one job, keyed by task name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub session_id: SessionId,
    pub topic: String,
    pub status: SessionStatus,
    /// `None` for tasks that produced no output.
    pub results: BTreeMap<String, Option<Value>>,
    pub tasks: Vec<TaskSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn result(&self, task: &str) -> Option<&Value> {
        self.results.get(task).and_then(Option::as_ref)
    }

    fn from_outcomes(session: &Session, outcomes: &[TaskOutcome]) -> Self {
        Self {
            session_id: session.id.clone(),
            topic: session.topic.clone(),
            status: session.status,
            results: outcomes
                .iter()
                .map(|o| (o.task.clone(), o.output().cloned()))
                .collect(),
            tasks: outcomes.iter().map(TaskOutcome::summary).collect(),
            error: session.error_message.clone(),
        }
    }

    /// Rebuild a report from a stored session and its action log.
    pub fn from_record(session: &Session, actions: &[ActionLogEntry], plan: &JobPlan) -> Self {
        let mut results = BTreeMap::new();
        let mut tasks = Vec::with_capacity(plan.len());

        for spec in plan.tasks() {
            let last = actions
                .iter()
                .rev()
                .find(|e| e.worker == spec.name && e.action != action::EXECUTE_START);
            let (output, status, error) = match last {
                Some(e) if e.is_completion() => (e.output.clone(), TaskStatus::Succeeded, None),
                Some(e) => (None, TaskStatus::Failed, e.error.clone()),
                None => (None, TaskStatus::Failed, Some(TaskFailure::NotLaunched.to_string())),
            };
            results.insert(spec.name.clone(), output);
            tasks.push(TaskSummary {
                task: spec.name.clone(),
                worker: spec.worker.clone(),
                essential: spec.essential,
                status,
                error,
                error_kind: None,
                duration_ms: last.and_then(|e| e.duration_ms).unwrap_or(0),
            });
        }

        Self {
            session_id: session.id.clone(),
            topic: session.topic.clone(),
            status: session.status,
            results,
            tasks,
            error: session.error_message.clone(),
        }
    }
}

/// Outputs of tasks that already completed in an earlier run.
fn completed_outputs(actions: &[ActionLogEntry]) -> HashMap<String, Value> {
    actions
        .iter()
        .filter(|e| e.is_completion())
        .filter_map(|e| Some((e.worker.clone(), e.output.clone()?)))
        .collect()
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

/// Removes a job from the active set when its run ends, however it ends.
struct ActiveGuard<'a> {
    active: &'a DashMap<SessionId, CancellationToken>,
    id: SessionId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

/// Why the fan-out stopped early.
enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

impl Interrupt {
    fn message(&self) -> String {
        match self {
            Self::Cancelled => "job cancelled".into(),
            Self::TimedOut(limit) if limit.subsec_nanos() == 0 => {
                format!("job timed out after {}s", limit.as_secs())
            }
            Self::TimedOut(limit) => format!("job timed out after {}ms", limit.as_millis()),
        }
    }
}

/// Runs jobs: owns each session's lifecycle and fans tasks out over a
/// [`JoinSet`].
pub struct Orchestrator {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn SessionStore>,
    plan: JobPlan,
    job_timeout: Option<Duration>,
    metrics: Option<Arc<MetricsRecorder>>,
    active: DashMap<SessionId, CancellationToken>,
}

impl Orchestrator {
    /// Fails when a task in `plan` names a worker that is not registered.
    pub fn new(
        registry: WorkerRegistry,
        store: Arc<dyn SessionStore>,
        plan: JobPlan,
    ) -> Result<Self, EngineError> {
        if let Some(task) = plan.tasks().iter().find(|t| !registry.contains(&t.worker)) {
            return Err(EngineError::UnknownWorker(task.worker.clone()));
        }
        Ok(Self {
            registry: Arc::new(registry),
            store,
            plan,
            job_timeout: None,
            metrics: None,
            active: DashMap::new(),
        })
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn plan(&self) -> &JobPlan {
        &self.plan
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn active_jobs(&self) -> Vec<SessionId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Cancel a running job. Returns false when no such job is active.
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.active.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn run_job(&self, topic: &str, resume: Option<&SessionId>) -> Result<JobReport, EngineError> {
        self.run_job_with_cancel(topic, resume, CancellationToken::new()).await
    }

    /// Run (or resume) a job.
    ///
    /// Errors creating or loading the session are returned as-is. After
    /// that, task failures end up in the report and store failures are only
    /// logged; the session always reaches a terminal status.
    #[instrument(skip_all, fields(session_id = tracing::field::Empty, resumed = resume.is_some()))]
    pub async fn run_job_with_cancel(
        &self,
        topic: &str,
        resume: Option<&SessionId>,
        cancel: CancellationToken,
    ) -> Result<JobReport, EngineError> {
        let (mut session, prior) = match resume {
            Some(id) => {
                let session = self.store.load(id)?;
                let actions = self.store.actions(id)?;
                if session.is_terminal() {
                    info!(session_id = %id, status = %session.status, "session already finished");
                    return Ok(JobReport::from_record(&session, &actions, &self.plan));
                }
                (session, completed_outputs(&actions))
            }
            None => {
                let topic = validate_topic(topic)?;
                (self.store.create(&topic)?, HashMap::new())
            }
        };
        Span::current().record("session_id", tracing::field::display(&session.id));

        let token = cancel.child_token();
        let _guard = self.register_active(&session.id, &token)?;

        self.metric_counter(names::JOBS_STARTED);
        self.metric_gauge(names::JOBS_ACTIVE, 1);

        let result = self.drive(&mut session, prior, &token).await;
        self.metric_gauge(names::JOBS_ACTIVE, -1);

        match result {
            Ok(report) => {
                self.metric_counter(if report.succeeded() {
                    names::JOBS_COMPLETED
                } else {
                    names::JOBS_FAILED
                });
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "job aborted");
                self.metric_counter(names::JOBS_FAILED);
                if !session.is_terminal() {
                    self.persist_status(&session.id, SessionStatus::Failed, Some(&e.to_string()));
                }
                Err(e)
            }
        }
    }

    fn register_active<'a>(
        &'a self,
        id: &SessionId,
        token: &CancellationToken,
    ) -> Result<ActiveGuard<'a>, EngineError> {
        match self.active.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::AlreadyRunning(id.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(ActiveGuard {
                    active: &self.active,
                    id: id.clone(),
                })
            }
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        prior: HashMap<String, Value>,
        token: &CancellationToken,
    ) -> Result<JobReport, EngineError> {
        let mut running_stored = session.status == SessionStatus::Running;
        if session.status == SessionStatus::Pending {
            session.transition(SessionStatus::Running, None)?;
            running_stored = self.persist_status(&session.id, SessionStatus::Running, None);
        }
        record(
            self.store.as_ref(),
            &ActionLogEntry::new(&session.id, ORCHESTRATOR, action::JOB_START).with_input(json!({
                "topic": session.topic,
                "tasks": self.plan.len(),
                "reused": prior.keys().collect::<Vec<_>>(),
            })),
        );
        info!(topic = %session.topic, reused = prior.len(), "job started");

        let started = Instant::now();
        let (outcomes, interrupt) = self.fan_out(session, prior, token).await;

        let failures = essential_failures(&outcomes);
        let error = match (&interrupt, failures) {
            (Some(i), Some(f)) => Some(format!("{}; {f}", i.message())),
            (Some(i), None) => Some(i.message()),
            (None, f) => f,
        };
        let status = if error.is_some() {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };

        session.transition(status, error.clone())?;
        if !running_stored {
            // the stored row is still pending and cannot jump to a terminal status
            self.persist_status(&session.id, SessionStatus::Running, None);
        }
        self.persist_status(&session.id, status, error.as_deref());

        let report = JobReport::from_outcomes(session, &outcomes);
        record(
            self.store.as_ref(),
            &ActionLogEntry::new(&session.id, ORCHESTRATOR, action::JOB_FINISH)
                .with_output(json!({ "status": status, "error": error }))
                .with_duration_ms(started.elapsed().as_millis() as u64),
        );
        info!(status = %status, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
        Ok(report)
    }

    /// Launch every task as soon as its dependencies are terminal and collect
    /// all outcomes. Returns outcomes in plan order.
    async fn fan_out(
        &self,
        session: &Session,
        mut prior: HashMap<String, Value>,
        token: &CancellationToken,
    ) -> (Vec<TaskOutcome>, Option<Interrupt>) {
        let mut done: HashMap<String, TaskOutcome> = HashMap::new();
        for spec in self.plan.tasks() {
            if let Some(output) = prior.remove(&spec.name) {
                done.insert(spec.name.clone(), reused_outcome(spec, output));
            }
        }

        let mut launched: HashSet<String> = done.keys().cloned().collect();
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, &TaskSpec> = HashMap::new();
        let deadline = self.job_timeout.map(|limit| (Instant::now() + limit, limit));
        let mut interrupt = None;

        loop {
            // Repeat until stable: a task that fails without running can
            // unblock its dependents immediately.
            while !token.is_cancelled() {
                let before = launched.len();
                for spec in self.plan.tasks() {
                    if launched.contains(&spec.name) || !spec.depends_on.iter().all(|d| done.contains_key(d)) {
                        continue;
                    }
                    launched.insert(spec.name.clone());
                    match self.registry.get(&spec.worker) {
                        Some(worker) => {
                            let input = task_input(&session.topic, spec, &done);
                            self.log_handoffs(&session.id, spec, &input);
                            let task = self.run_task(session.id.clone(), spec.clone(), worker, input, token.clone());
                            let handle = set.spawn(task);
                            running.insert(handle.id(), spec);
                        }
                        None => {
                            done.insert(
                                spec.name.clone(),
                                failed_outcome(spec, TaskFailure::UnknownWorker(spec.worker.clone())),
                            );
                        }
                    }
                }
                if launched.len() == before {
                    break;
                }
            }

            if set.is_empty() {
                break;
            }

            tokio::select! {
                joined = set.join_next_with_id() => match joined {
                    Some(Ok((id, outcome))) => {
                        running.remove(&id);
                        self.observe(&outcome);
                        done.insert(outcome.task.clone(), outcome);
                    }
                    Some(Err(join_err)) => {
                        let Some(spec) = running.remove(&join_err.id()) else {
                            error!(error = %join_err, "untracked task ended abnormally");
                            continue;
                        };
                        error!(task = %spec.name, error = %join_err, "task ended abnormally");
                        let outcome = failed_outcome(spec, TaskFailure::Panicked(join_err.to_string()));
                        self.observe(&outcome);
                        done.insert(spec.name.clone(), outcome);
                    }
                    None => break,
                },
                _ = token.cancelled(), if interrupt.is_none() => {
                    warn!("job cancelled, stopping tasks");
                    interrupt = Some(Interrupt::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline.map_or_else(Instant::now, |(at, _)| at)),
                    if deadline.is_some() && interrupt.is_none() =>
                {
                    if let Some((_, limit)) = deadline {
                        warn!(timeout_secs = limit.as_secs(), "job timed out, stopping tasks");
                        interrupt = Some(Interrupt::TimedOut(limit));
                    }
                    token.cancel();
                }
            }
        }

        // Cancelled before the drain loop ever saw the token.
        if interrupt.is_none() && token.is_cancelled() {
            interrupt = Some(Interrupt::Cancelled);
        }

        let outcomes = self
            .plan
            .tasks()
            .iter()
            .map(|spec| {
                done.remove(&spec.name)
                    .unwrap_or_else(|| failed_outcome(spec, TaskFailure::NotLaunched))
            })
            .collect();
        (outcomes, interrupt)
    }

    fn run_task(
        &self,
        session_id: SessionId,
        spec: TaskSpec,
        worker: Arc<dyn Worker>,
        input: WorkerInput,
        token: CancellationToken,
    ) -> impl std::future::Future<Output = TaskOutcome> + Send + 'static {
        let store = Arc::clone(&self.store);
        async move {
            let start = Instant::now();
            let ctx = ExecutionContext {
                session_id: &session_id,
                task: &spec.name,
                store: store.as_ref(),
                cancel: &token,
            };
            let result = match AssertUnwindSafe(execute_with_logging(worker.as_ref(), &ctx, &input))
                .catch_unwind()
                .await
            {
                Ok(r) => r.map_err(TaskFailure::from),
                Err(panic) => {
                    let msg = panic_message(&panic);
                    error!(task = %spec.name, panic = %msg, "worker panicked");
                    Err(TaskFailure::Panicked(msg))
                }
            };
            TaskOutcome {
                task: spec.name,
                worker: spec.worker,
                essential: spec.essential,
                result,
                elapsed: start.elapsed(),
                resumed: false,
            }
        }
    }

    fn log_handoffs(&self, session_id: &SessionId, spec: &TaskSpec, input: &WorkerInput) {
        for dep in input.deps.keys() {
            record(
                self.store.as_ref(),
                &ActionLogEntry::new(session_id, ORCHESTRATOR, action::HANDOFF)
                    .with_input(json!({ "from": dep, "to": spec.name })),
            );
            info!(from = %dep, to = %spec.name, "handoff");
        }
    }

    fn observe(&self, outcome: &TaskOutcome) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let labels = [("task", outcome.task.as_str())];
        metrics.histogram_observe(names::TASK_DURATION_MS, &labels, outcome.elapsed.as_millis() as f64);
        if !outcome.succeeded() {
            metrics.counter_inc(names::TASKS_FAILED, &labels, 1);
        }
    }

    /// Best-effort status write; returns whether it was stored.
    fn persist_status(&self, id: &SessionId, status: SessionStatus, error: Option<&str>) -> bool {
        match self.store.update_status(id, status, error) {
            Ok(_) => true,
            Err(e) => {
                warn!(session_id = %id, status = %status, error = %e, "failed to persist session status");
                false
            }
        }
    }

    fn metric_counter(&self, name: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, &[], 1);
        }
    }

    fn metric_gauge(&self, name: &str, delta: i64) {
        if let Some(m) = &self.metrics {
            m.gauge_add(name, &[], delta);
        }
    }
}

/// Topic plus the outputs of the dependencies that succeeded.
fn task_input(topic: &str, spec: &TaskSpec, done: &HashMap<String, TaskOutcome>) -> WorkerInput {
    spec.depends_on
        .iter()
        .filter_map(|dep| Some((dep, done.get(dep)?.output()?)))
        .fold(WorkerInput::new(topic), |input, (dep, output)| {
            input.with_dep(dep.clone(), output.clone())
        })
}

fn reused_outcome(spec: &TaskSpec, output: Value) -> TaskOutcome {
    TaskOutcome {
        task: spec.name.clone(),
        worker: spec.worker.clone(),
        essential: spec.essential,
        result: Ok(output),
        elapsed: Duration::ZERO,
        resumed: true,
    }
}

fn failed_outcome(spec: &TaskSpec, failure: TaskFailure) -> TaskOutcome {
    TaskOutcome {
        task: spec.name.clone(),
        worker: spec.worker.clone(),
        essential: spec.essential,
        result: Err(failure),
        elapsed: Duration::ZERO,
        resumed: false,
    }
}
