//! Built-in workers, one per [`WorkerRole`].

pub mod analysis;
pub mod dialog;
pub mod keywords;
pub mod post;
pub mod research;

use std::sync::Arc;

use quill_core::config::{ModelConfig, ModelSettings, WorkerRole};
use quill_core::errors::RemoteError;
use quill_core::messages::{ChatMessage, ChatRequest};
use quill_gateway::RemoteClient;

use crate::worker::{Worker, WorkerRegistry};

pub use analysis::AnalysisWorker;
pub use dialog::DialogWorker;
pub use keywords::KeywordsWorker;
pub use post::PostWorker;
pub use research::ResearchWorker;

/// A remote client bound to one role's model settings.
#[derive(Clone)]
pub struct Generator {
    client: Arc<dyn RemoteClient>,
    model: ModelConfig,
}

impl Generator {
    pub fn new(client: Arc<dyn RemoteClient>, model: ModelConfig) -> Self {
        Self { client, model }
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// One system + user exchange; returns the reply text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, RemoteError> {
        let request = ChatRequest::new(
            &self.model.model,
            vec![ChatMessage::system(system), ChatMessage::user(user)],
        )
        .with_temperature(self.model.temperature)
        .with_max_tokens(self.model.max_tokens);

        let response = self.client.send(&request).await?;
        Ok(response.content)
    }
}

/// Construct the built-in worker for `role`.
pub fn builtin(role: WorkerRole, client: Arc<dyn RemoteClient>, models: &ModelSettings) -> Arc<dyn Worker> {
    let generator = Generator::new(client, models.for_role(role).clone());
    match role {
        WorkerRole::Analysis => Arc::new(AnalysisWorker::new(generator)),
        WorkerRole::Research => Arc::new(ResearchWorker::new(generator)),
        WorkerRole::Keywords => Arc::new(KeywordsWorker::new(generator)),
        WorkerRole::Post => Arc::new(PostWorker::new(generator)),
        WorkerRole::Dialog => Arc::new(DialogWorker::new(generator)),
    }
}

/// Registry holding every built-in worker, sharing one client.
pub fn builtin_registry(client: Arc<dyn RemoteClient>, models: &ModelSettings) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    for role in WorkerRole::ALL {
        registry.register(builtin(role, Arc::clone(&client), models));
    }
    registry
}

/// Count whitespace-separated words.
pub(crate) fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
