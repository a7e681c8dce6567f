use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, ErrorKind};

/// The built-in worker roles. Each one has its own model settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Analysis,
    Research,
    Keywords,
    Post,
    Dialog,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 5] = [
        Self::Analysis,
        Self::Research,
        Self::Keywords,
        Self::Post,
        Self::Dialog,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Research => "research",
            Self::Keywords => "keywords",
            Self::Post => "post",
            Self::Dialog => "dialog",
        }
    }

    fn env_var(self) -> &'static str {
        match self {
            Self::Analysis => "QUILL_ANALYSIS_MODEL",
            Self::Research => "QUILL_RESEARCH_MODEL",
            Self::Keywords => "QUILL_KEYWORDS_MODEL",
            Self::Post => "QUILL_POST_MODEL",
            Self::Dialog => "QUILL_DIALOG_MODEL",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".into(),
            api_key: None,
            request_timeout_secs: 120,
            user_agent: concat!("quill/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Error kinds worth another attempt.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            retry_on: ErrorKind::TRANSIENT.to_vec(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl ModelConfig {
    fn new(model: &str, max_tokens: u32, temperature: f64) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            temperature,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub analysis: ModelConfig,
    pub research: ModelConfig,
    pub keywords: ModelConfig,
    pub post: ModelConfig,
    pub dialog: ModelConfig,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            analysis: ModelConfig::new("openai/gpt-5", 4000, 0.7),
            research: ModelConfig::new("anthropic/claude-3-opus", 8000, 0.3),
            keywords: ModelConfig::new("google/gemini-2.5-flash", 2000, 0.5),
            post: ModelConfig::new("openai/gpt-4", 1000, 0.8),
            dialog: ModelConfig::new("anthropic/claude-3-sonnet", 3000, 0.9),
        }
    }
}

impl ModelSettings {
    pub fn for_role(&self, role: WorkerRole) -> &ModelConfig {
        match role {
            WorkerRole::Analysis => &self.analysis,
            WorkerRole::Research => &self.research,
            WorkerRole::Keywords => &self.keywords,
            WorkerRole::Post => &self.post,
            WorkerRole::Dialog => &self.dialog,
        }
    }

    fn for_role_mut(&mut self, role: WorkerRole) -> &mut ModelConfig {
        match role {
            WorkerRole::Analysis => &mut self.analysis,
            WorkerRole::Research => &mut self.research,
            WorkerRole::Keywords => &mut self.keywords,
            WorkerRole::Post => &mut self.post,
            WorkerRole::Dialog => &mut self.dialog,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Whole-job deadline. Zero disables it.
    pub timeout_secs: u64,
    /// Tasks whose failure fails the session.
    pub essential_tasks: Vec<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            essential_tasks: vec!["research".into(), "post".into()],
        }
    }
}

impl JobSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn is_essential(&self, task: &str) -> bool {
        self.essential_tasks.iter().any(|t| t == task)
    }
}

/// Top-level configuration, built once at startup and passed down.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QuillConfig {
    pub gateway: GatewaySettings,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub models: ModelSettings,
    pub job: JobSettings,
    pub database_path: PathBuf,
    pub log_level: String,
    /// Log one JSON object per line.
    pub log_json: bool,
}

impl Default for QuillConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            models: ModelSettings::default(),
            job: JobSettings::default(),
            database_path: PathBuf::from("quill.db"),
            log_level: "info".into(),
            log_json: false,
        }
    }
}

impl QuillConfig {
    /// Defaults, then the optional JSON file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            CoreError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENROUTER_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.gateway.api_key = Some(SecretString::from(key));
        }
        if let Some(path) = lookup("QUILL_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("QUILL_LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        if let Some(raw) = lookup("QUILL_LOG_JSON") {
            self.log_json = parse_flag("QUILL_LOG_JSON", &raw)?;
        }
        if let Some(raw) = lookup("QUILL_MAX_RETRIES") {
            self.retry.max_retries = parse_number("QUILL_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("QUILL_TIMEOUT_SECONDS") {
            self.gateway.request_timeout_secs = parse_number("QUILL_TIMEOUT_SECONDS", &raw)?;
        }
        for role in WorkerRole::ALL {
            if let Some(model) = lookup(role.env_var()) {
                self.models.for_role_mut(role).model = model;
            }
        }
        Ok(())
    }

    pub fn validate(&self, require_api_key: bool) -> Result<(), CoreError> {
        if require_api_key && self.gateway.api_key.is_none() {
            return Err(CoreError::InvalidConfig(
                "OPENROUTER_API_KEY is not set".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(CoreError::InvalidConfig(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(CoreError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(CoreError::InvalidConfig(
                "retry.exponential_base must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(var: &str, raw: &str) -> Result<bool, CoreError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(CoreError::InvalidConfig(format!("{var} must be a boolean, got {raw:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, CoreError> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::InvalidConfig(format!("{var} is not a number: {raw:?}")))
}
