use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use quill_core::config::BreakerSettings;
use quill_core::errors::{Classify, CoreError, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open")]
    Open { name: String },
    #[error("{0}")]
    Inner(E),
}

impl<E: Classify> Classify for BreakerError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } => ErrorKind::CircuitOpen,
            Self::Inner(e) => e.kind(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(e) => e.retry_after(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub since_last_failure: Option<Duration>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Set while the single half-open trial is running.
    trial_in_flight: bool,
    /// Bumped on every state change; results admitted under an older
    /// epoch are dropped.
    epoch: u64,
}

impl BreakerState {
    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

type CountsFailure = dyn Fn(ErrorKind) -> bool + Send + Sync;

fn default_counts_failure(kind: ErrorKind) -> bool {
    !matches!(kind, ErrorKind::InvalidInput | ErrorKind::Cancelled)
}

/// Shields a flaky dependency: after `failure_threshold` counted failures
/// calls are rejected until `recovery_timeout` has passed, then one trial is
/// let through to decide whether to close again.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    counts_failure: Box<CountsFailure>,
    inner: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of an eligibility check.
#[derive(Clone, Copy, Debug)]
enum Admission {
    /// Ordinary call while closed, tagged with the epoch it was admitted in.
    Call { epoch: u64 },
    /// The single half-open trial call.
    Trial,
}

/// Clears the trial flag if a trial is dropped before it records a result.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, CoreError> {
        if config.failure_threshold == 0 {
            return Err(CoreError::InvalidConfig(
                "circuit breaker failure_threshold must be at least 1".into(),
            ));
        }
        Ok(Self {
            name: name.into(),
            config,
            counts_failure: Box::new(default_counts_failure),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
                epoch: 0,
            }),
        })
    }

    /// Replace the predicate deciding which error kinds count as failures.
    pub fn with_counted<F>(mut self, predicate: F) -> Self
    where
        F: Fn(ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.counts_failure = Box::new(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            since_last_failure: inner.last_failure.map(|t| t.elapsed()),
        }
    }

    /// Run `operation` if the breaker admits it and record its result.
    ///
    /// A rejected call returns `BreakerError::Open` without touching any state.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let admission = self.admit().ok_or_else(|| BreakerError::Open {
            name: self.name.clone(),
        })?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: matches!(admission, Admission::Trial),
        };

        let result = operation().await;
        guard.armed = false;

        self.record(admission, result.as_ref().err().map(Classify::kind));
        result.map_err(BreakerError::Inner)
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Call { epoch: inner.epoch }),
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .map_or(true, |t| t.elapsed() > self.config.recovery_timeout);
                if !cooled {
                    return None;
                }
                info!(breaker = %self.name, "circuit half-open, admitting trial");
                inner.enter(CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    /// Apply one finished call; `failure` is `None` on success.
    fn record(&self, admission: Admission, failure: Option<ErrorKind>) {
        let mut inner = self.inner.lock();
        let counted = failure.is_some_and(|kind| (self.counts_failure)(kind));

        match admission {
            Admission::Call { epoch } if epoch != inner.epoch => {
                debug!(breaker = %self.name, state = %inner.state, "dropping result admitted before a state change");
            }
            Admission::Call { .. } => {
                if failure.is_none() {
                    inner.failure_count = 0;
                } else if counted {
                    self.count_failure(&mut inner);
                    if inner.failure_count >= self.config.failure_threshold {
                        self.open(&mut inner);
                    }
                }
            }
            Admission::Trial => {
                inner.trial_in_flight = false;
                if failure.is_none() {
                    info!(breaker = %self.name, "circuit closed after successful trial");
                    inner.failure_count = 0;
                    inner.enter(CircuitState::Closed);
                } else if counted {
                    self.count_failure(&mut inner);
                    self.open(&mut inner);
                }
            }
        }
    }

    fn count_failure(&self, inner: &mut BreakerState) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
    }

    fn open(&self, inner: &mut BreakerState) {
        warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            recovery_secs = self.config.recovery_timeout.as_secs(),
            "circuit opened"
        );
        inner.enter(CircuitState::Open);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::errors::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
        )
        .unwrap()
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError<RemoteError>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Network("down".into()))
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<u32, BreakerError<RemoteError>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RemoteError>(1)
        })
        .await
    }

    #[test]
    fn zero_threshold_is_invalid() {
        let err = CircuitBreaker::new(
            "x",
            BreakerConfig {
                failure_threshold: 0,
                recovery_timeout: Duration::from_secs(1),
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn starts_closed_and_passes_values_through() {
        let b = breaker(3, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(succeed(&b, &calls).await.unwrap(), 1);
        let err = fail(&b, &calls).await.unwrap_err();
        assert!(matches!(err, BreakerError::Inner(RemoteError::Network(_))));
        assert_eq!(b.failure_count(), 1);
    }

    #[tokio::test]
    async fn opens_at_threshold_and_rejects_without_calling() {
        let b = breaker(3, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(matches!(err, BreakerError::Open { .. }));
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(b.failure_count(), 3);
    }

    #[tokio::test]
    async fn success_resets_count_while_closed() {
        let b = breaker(3, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let b = breaker(2, Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_without_reset() {
        let b = breaker(2, Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let err = fail(&b, &calls).await.unwrap_err();
        assert!(matches!(err, BreakerError::Inner(_)));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 3);

        // The recovery window restarts from the trial failure
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let b = Arc::new(breaker(1, Duration::from_secs(5)));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = Arc::clone(&b);
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, RemoteError>("trial")
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let concurrent = succeed(&b, &calls).await;
        assert!(matches!(concurrent, Err(BreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "trial");
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let b = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let hung = b.call(|| std::future::pending::<Result<(), RemoteError>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), hung).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    /// Start a call that completes with `outcome` once released.
    fn held_call(
        b: &Arc<CircuitBreaker>,
        outcome: Result<(), RemoteError>,
    ) -> (
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<Result<(), BreakerError<RemoteError>>>,
    ) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let b = Arc::clone(b);
        let handle = tokio::spawn(async move {
            b.call(|| async move {
                let _ = rx.await;
                outcome
            })
            .await
        });
        (tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_needs_the_full_timeout_to_pass() {
        let b = breaker(1, Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_millis(1)).await;
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_from_before_opening_is_ignored() {
        let b = Arc::new(breaker(2, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);
        let (release, slow) = held_call(&b, Ok(()));
        tokio::task::yield_now().await;

        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Open);

        release.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 2);
        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_from_before_opening_is_not_counted() {
        let b = Arc::new(breaker(1, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);
        let (release, slow) = held_call(&b, Err(RemoteError::Network("late".into())));
        tokio::task::yield_now().await;

        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        release.send(()).unwrap();
        assert!(slow.await.unwrap().is_err());
        assert_eq!(b.failure_count(), 1);

        // the window still runs from the failure that opened the circuit
        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_does_not_free_the_trial_slot() {
        let b = Arc::new(breaker(1, Duration::from_secs(5)));
        let calls = AtomicU32::new(0);
        let (release_early, early) = held_call(&b, Err(RemoteError::Cancelled));
        tokio::task::yield_now().await;

        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        let (release_trial, trial) = held_call(&b, Ok(()));
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        release_early.send(()).unwrap();
        assert!(early.await.unwrap().is_err());

        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release_trial.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn uncounted_trial_failure_keeps_half_open() {
        let b = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let cancelled = b.call(|| async { Err::<(), _>(RemoteError::Cancelled) }).await;
        assert!(cancelled.is_err());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.failure_count(), 1);

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn uncounted_kinds_do_not_trip() {
        let b = breaker(1, Duration::from_secs(60));
        let result = b
            .call(|| async { Err::<(), _>(RemoteError::Cancelled) })
            .await;
        assert!(result.is_err());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test]
    async fn custom_predicate() {
        let b = breaker(1, Duration::from_secs(60))
            .with_counted(|kind| kind == ErrorKind::ServerError);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_are_all_counted() {
        let b = Arc::new(breaker(1000, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let b = Arc::clone(&b);
            handles.push(tokio::spawn(async move {
                let _ = b
                    .call(|| async { Err::<(), _>(RemoteError::Network("x".into())) })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(b.failure_count(), 50);
    }
}
