use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use quill_core::config::RetrySettings;
use quill_core::errors::{Classify, ErrorKind};

/// Supplies the jitter multiplier applied to a backoff delay.
pub trait JitterSource: Send + Sync + fmt::Debug {
    /// A factor in `[0.5, 1.0]`.
    fn factor(&self) -> f64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn factor(&self) -> f64 {
        rand::thread_rng().gen_range(0.5..=1.0)
    }
}

/// Constant jitter, for deterministic delays.
#[derive(Debug)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn factor(&self) -> f64 {
        self.0.clamp(0.5, 1.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    GiveUp,
    RetryAfter(Duration),
}

/// When and how long to wait before re-running a failed operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub retry_on: Vec<ErrorKind>,
    pub jitter: bool,
    jitter_source: Arc<dyn JitterSource>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            exponential_base: settings.exponential_base,
            retry_on: settings.retry_on.clone(),
            jitter: settings.jitter,
            jitter_source: Arc::new(RandomJitter),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_retry_on(mut self, kinds: &[ErrorKind]) -> Self {
        self.retry_on = kinds.to_vec();
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_jitter_source(mut self, source: Arc<dyn JitterSource>) -> Self {
        self.jitter = true;
        self.jitter_source = source;
        self
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// `min(base * exponential_base^attempt, max_delay)` without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .exponential_base
            .powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Decide what happens after `attempt` (0-based) failed with `error`.
    ///
    /// A wait requested by the error (`Retry-After`) is a floor on the
    /// backoff, still capped at `max_delay`.
    pub fn decide<E: Classify + ?Sized>(&self, attempt: u32, error: &E) -> RetryDecision {
        if !self.is_retryable(error.kind()) || attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let mut delay = self.backoff_delay(attempt);
        if self.jitter {
            delay = delay.mul_f64(self.jitter_source.factor());
        }
        if let Some(asked) = error.retry_after() {
            delay = delay.max(asked.min(self.max_delay));
        }
        RetryDecision::RetryAfter(delay)
    }
}

fn log_give_up<E: Classify + fmt::Display>(
    policy: &RetryPolicy,
    op_name: &str,
    attempt: u32,
    error: &E,
) {
    let kind = error.kind();
    if policy.is_retryable(kind) {
        warn!(op = op_name, attempts = attempt + 1, kind = %kind, error = %error, "all retry attempts failed");
    } else {
        debug!(op = op_name, kind = %kind, error = %error, "error is not retryable");
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts. The last error is returned unchanged.
///
/// Backoff waits on `tokio::time::sleep`, so dropping the future cancels the
/// wait.
pub async fn retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(op = op_name, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => match policy.decide(attempt, &error) {
                RetryDecision::GiveUp => {
                    log_give_up(policy, op_name, attempt, &error);
                    return Err(error);
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

/// Blocking counterpart of [`retry_async`]. Same decisions, but waits with
/// `std::thread::sleep`. Never call it from an async task.
pub fn retry_blocking<T, E, F>(policy: &RetryPolicy, op_name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: Classify + fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation() {
            Ok(value) => {
                if attempt > 0 {
                    info!(op = op_name, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => match policy.decide(attempt, &error) {
                RetryDecision::GiveUp => {
                    log_give_up(policy, op_name, attempt, &error);
                    return Err(error);
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            },
        }
    }
}
