//! Logging setup and the shared metrics recorder.

mod metrics;

pub use metrics::{names, HistogramSummary, MetricsRecorder, MetricsSnapshot, BUCKET_BOUNDS_MS};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Transport crates that are chatty below `warn`.
const QUIET_CRATES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

/// How the process logs. `RUST_LOG`, when set, replaces the computed filter.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub level: Level,
    /// One JSON object per line instead of compact text.
    pub json: bool,
    /// Extra `target=level` directives appended after the defaults.
    pub directives: Vec<String>,
}

impl TelemetryConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            json: false,
            directives: Vec::new(),
        }
    }

    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn filter_directive(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut parts = vec![level];
        if self.level > Level::WARN {
            parts.extend(QUIET_CRATES.iter().map(|c| format!("{c}=warn")));
        }
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

/// Parse a level name as used in config files and env vars.
pub fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(Level::WARN),
        other => other.parse().ok(),
    }
}

/// Process-wide telemetry handles.
pub struct Telemetry {
    metrics: Arc<MetricsRecorder>,
}

impl Telemetry {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Install the log subscriber on stderr; stdout is left for reports. Later
/// calls keep the first subscriber and only hand back a fresh recorder.
pub fn init_telemetry(config: &TelemetryConfig) -> Telemetry {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("log subscriber already installed");
    }

    Telemetry {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}
