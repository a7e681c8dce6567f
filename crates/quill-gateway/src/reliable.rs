use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use quill_core::errors::{Classify, RemoteError};
use quill_core::messages::{ChatRequest, ChatResponse};
use quill_telemetry::{names, MetricsRecorder};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::client::RemoteClient;
use crate::retry::{retry_async, RetryPolicy};

/// Wraps a [`RemoteClient`] with the retry policy and a shared breaker.
///
/// Every attempt passes through the breaker, so an open circuit is seen by
/// the retry loop as a retryable `CircuitOpen` failure.
pub struct ReliableClient {
    inner: Arc<dyn RemoteClient>,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ReliableClient {
    pub fn new(inner: Arc<dyn RemoteClient>, policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            policy,
            breaker,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl RemoteClient for ReliableClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, RemoteError> {
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let inner = &self.inner;
        let breaker = &self.breaker;
        let metrics = self.metrics.as_deref();

        let result = retry_async(&self.policy, "remote.send", || async move {
            attempts_ref.fetch_add(1, Ordering::Relaxed);
            breaker
                .call(|| inner.send(request))
                .await
                .map_err(|e| match e {
                    BreakerError::Open { name } => {
                        if let Some(m) = metrics {
                            m.counter_inc(names::BREAKER_REJECTIONS, &[("breaker", name.as_str())], 1);
                        }
                        RemoteError::CircuitOpen(name)
                    }
                    BreakerError::Inner(e) => e,
                })
        })
        .await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        if let Some(m) = metrics {
            if retries > 0 {
                m.counter_inc(names::REMOTE_RETRIES, &[], u64::from(retries));
            }
            if let Err(e) = &result {
                m.counter_inc(names::REMOTE_FAILURES, &[("kind", e.kind().as_str())], 1);
            }
        }
        result
    }
}
