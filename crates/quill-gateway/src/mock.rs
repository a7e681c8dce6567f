use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use quill_core::errors::RemoteError;
use quill_core::messages::{ChatRequest, ChatResponse};

use crate::client::RemoteClient;

/// Pre-programmed replies for deterministic runs without network calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(RemoteError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

type Handler = dyn Fn(&ChatRequest) -> MockReply + Send + Sync;

enum Source {
    Script(Mutex<VecDeque<MockReply>>),
    Handler(Box<Handler>),
}

/// A [`RemoteClient`] that answers from a script or a request handler.
pub struct MockClient {
    source: Source,
    call_count: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockClient {
    /// Replies are consumed in call order.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            source: Source::Script(Mutex::new(replies.into())),
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies are computed per request, independent of call order.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ChatRequest) -> MockReply + Send + Sync + 'static,
    {
        Self {
            source: Source::Handler(Box::new(handler)),
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RemoteClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, RemoteError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let reply = match &self.source {
            Source::Script(queue) => queue.lock().pop_front(),
            Source::Handler(handler) => Some(handler(request)),
        };
        let Some(mut current) = reply else {
            return Err(RemoteError::InvalidRequest(format!(
                "MockClient: no reply configured for call {idx}"
            )));
        };

        loop {
            match current {
                MockReply::Text(text) => return Ok(ChatResponse::text(&request.model, text)),
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}
