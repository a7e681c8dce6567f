pub mod breaker;
pub mod client;
pub mod mock;
pub mod openrouter;
pub mod reliable;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState};
pub use client::RemoteClient;
pub use mock::{MockClient, MockReply};
pub use openrouter::OpenRouterClient;
pub use reliable::ReliableClient;
pub use retry::{retry_async, retry_blocking, RetryDecision, RetryPolicy};
