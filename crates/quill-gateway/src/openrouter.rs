use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};

use quill_core::config::GatewaySettings;
use quill_core::errors::RemoteError;
use quill_core::messages::{ChatRequest, ChatResponse, Usage};

use crate::client::RemoteClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI-compatible chat completions over HTTP.
pub struct OpenRouterClient {
    client: Client,
    endpoint: String,
    api_key: SecretString,
    timeout: Duration,
}

impl OpenRouterClient {
    pub fn new(settings: &GatewaySettings) -> Result<Self, RemoteError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| RemoteError::AuthenticationFailed("no API key configured".into()))?;
        let timeout = settings.request_timeout();
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .user_agent(settings.user_agent.as_str())
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key,
            timeout,
        })
    }

    fn map_transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl RemoteClient for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, RemoteError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.map_err(|e| self.map_transport_error(e))?;

        if !(200..300).contains(&status) {
            return Err(match RemoteError::from_status(status, body) {
                RemoteError::RateLimited { .. } => RemoteError::RateLimited { retry_after },
                other => other,
            });
        }

        let response = parse_completion(&body, &request.model)?;
        debug!(
            total_tokens = response.usage.total_tokens,
            chars = response.content.len(),
            "completion received"
        );
        Ok(response)
    }
}

#[derive(Deserialize)]
struct WireCompletion {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<Usage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    message: String,
    code: Option<u16>,
}

/// Decode a chat-completions body. Providers sometimes report errors with a
/// 200 status and an `error` object.
fn parse_completion(body: &str, requested_model: &str) -> Result<ChatResponse, RemoteError> {
    let wire: WireCompletion = serde_json::from_str(body)
        .map_err(|e| RemoteError::MalformedResponse(format!("invalid JSON body: {e}")))?;

    if let Some(err) = wire.error {
        return Err(RemoteError::from_status(err.code.unwrap_or(502), err.message));
    }

    let content = wire
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| RemoteError::MalformedResponse("response has no message content".into()))?;

    Ok(ChatResponse {
        model: wire.model.unwrap_or_else(|| requested_model.to_string()),
        content,
        usage: wire.usage.unwrap_or_default(),
    })
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}
