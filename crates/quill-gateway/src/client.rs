use async_trait::async_trait;

use quill_core::errors::RemoteError;
use quill_core::messages::{ChatRequest, ChatResponse};

/// The remote content-generation dependency.
///
/// Implementations make exactly one attempt per call; retries and breaking
/// are layered on top by [`crate::ReliableClient`].
#[async_trait]
pub trait RemoteClient: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, RemoteError>;
}
