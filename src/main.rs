//! # quill
//!
//! Command-line front end: runs content jobs, and inspects the sessions and
//! action logs they leave behind.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};

use quill_core::actions::ActionLogEntry;
use quill_core::config::QuillConfig;
use quill_core::ids::SessionId;
use quill_core::session::Session;
use quill_engine::demo::demo_client;
use quill_engine::workers::builtin_registry;
use quill_engine::{JobPlan, JobReport, Orchestrator};
use quill_gateway::{
    BreakerConfig, CircuitBreaker, OpenRouterClient, ReliableClient, RemoteClient, RetryPolicy,
};
use quill_store::{SessionStore, SqliteSessionStore};
use quill_telemetry::{init_telemetry, parse_level, MetricsRecorder, TelemetryConfig};

/// Analyze a topic, then generate research, keywords, a post and a voice script for it.
#[derive(Parser, Debug)]
#[command(name = "quill", version, about = "Resilient content-generation job runner")]
struct Cli {
    /// JSON config file, applied over the defaults and under the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a job for TOPIC, or resume an unfinished one.
    Run {
        /// Not needed when resuming; the stored topic is used.
        #[arg(required_unless_present = "session_id")]
        topic: Option<String>,

        /// Resume this session instead of creating a new one.
        #[arg(long)]
        session_id: Option<SessionId>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Answer from canned replies instead of calling the provider.
        #[arg(long)]
        mock: bool,
    },
    /// Show a session and its action log.
    Show {
        session_id: SessionId,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List recent sessions, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = QuillConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        parse_level(&config.log_level).unwrap_or(Level::INFO)
    };
    let telemetry = init_telemetry(&TelemetryConfig::new(level).json(config.log_json));
    let metrics = telemetry.metrics();

    let code = match cli.command {
        Command::Run {
            topic,
            session_id,
            format,
            mock,
        } => run(&config, Arc::clone(&metrics), topic.as_deref().unwrap_or_default(), session_id, format, mock).await?,
        Command::Show { session_id, format } => {
            show(&config, &session_id, format)?;
            ExitCode::SUCCESS
        }
        Command::List { limit } => {
            list(&config, limit)?;
            ExitCode::SUCCESS
        }
    };

    debug!(metrics = %serde_json::to_string(&metrics.snapshot())?, "metrics at exit");
    Ok(code)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_store(config: &QuillConfig) -> Result<SqliteSessionStore> {
    let path = &config.database_path;
    ensure_parent_dir(path)?;
    let store = SqliteSessionStore::open(path)
        .with_context(|| format!("failed to open database: {}", path.display()))?;
    debug!(path = %path.display(), "database opened");
    Ok(store)
}

async fn run(
    config: &QuillConfig,
    metrics: Arc<MetricsRecorder>,
    topic: &str,
    resume: Option<SessionId>,
    format: OutputFormat,
    mock: bool,
) -> Result<ExitCode> {
    config.validate(!mock).context("invalid configuration")?;

    let provider: Arc<dyn RemoteClient> = if mock {
        info!("using canned provider replies");
        Arc::new(demo_client())
    } else {
        Arc::new(OpenRouterClient::new(&config.gateway).context("failed to build provider client")?)
    };
    let breaker = Arc::new(CircuitBreaker::new(
        provider.name().to_string(),
        BreakerConfig::from(&config.breaker),
    )?);
    let client = ReliableClient::new(provider, RetryPolicy::from_settings(&config.retry), breaker)
        .with_metrics(Arc::clone(&metrics));

    let registry = builtin_registry(Arc::new(client), &config.models);
    let store: Arc<dyn SessionStore> = Arc::new(open_store(config)?);
    let orchestrator = Orchestrator::new(registry, store, JobPlan::default_plan(&config.job)?)?
        .with_job_timeout(config.job.timeout())
        .with_metrics(metrics);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling job");
            on_signal.cancel();
        }
    });

    let report = orchestrator
        .run_job_with_cancel(topic, resume.as_ref(), cancel)
        .await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_report(&report)),
    }
    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn show(config: &QuillConfig, id: &SessionId, format: OutputFormat) -> Result<()> {
    let store = open_store(config)?;
    let session = store.load(id)?;
    let actions = store.actions(id)?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session": session,
                "actions": actions,
            }))?
        ),
        OutputFormat::Text => {
            print!("{}", render_session(&session));
            println!("\nactions ({}):", actions.len());
            for entry in &actions {
                println!("  {}", render_action(entry));
            }
        }
    }
    Ok(())
}

fn list(config: &QuillConfig, limit: u32) -> Result<()> {
    let sessions = open_store(config)?.list(limit)?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for s in &sessions {
        println!(
            "{}  {:<9}  {}  {}",
            s.id,
            s.status.to_string(),
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.topic
        );
    }
    Ok(())
}

fn render_session(session: &Session) -> String {
    let mut out = format!(
        "session   {}\ntopic     {}\nstatus    {}\ncreated   {}\n",
        session.id,
        session.topic,
        session.status,
        session.created_at.format("%Y-%m-%d %H:%M:%S"),
    );
    if let Some(at) = session.completed_at {
        out.push_str(&format!("completed {}\n", at.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(err) = &session.error_message {
        out.push_str(&format!("error     {err}\n"));
    }
    out
}

fn render_action(entry: &ActionLogEntry) -> String {
    let mut line = format!(
        "{}  {:<12} {:<17}",
        entry.timestamp.format("%H:%M:%S%.3f"),
        entry.worker,
        entry.action
    );
    if let Some(ms) = entry.duration_ms {
        line.push_str(&format!(" {ms}ms"));
    }
    if let Some(err) = &entry.error {
        line.push_str(&format!("  error: {err}"));
    }
    line
}

fn render_report(report: &JobReport) -> String {
    let mut out = format!(
        "session  {}\ntopic    {}\nstatus   {}\n",
        report.session_id, report.topic, report.status
    );
    if let Some(err) = &report.error {
        out.push_str(&format!("error    {err}\n"));
    }

    out.push_str("\ntasks:\n");
    for t in &report.tasks {
        let status = serde_json::to_value(t.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        out.push_str(&format!(
            "  {:<10} {:<10} {:>7}ms{}{}\n",
            t.task,
            status,
            t.duration_ms,
            if t.essential { "" } else { "  (optional)" },
            t.error.as_deref().map(|e| format!("  {e}")).unwrap_or_default(),
        ));
    }

    for (task, output) in &report.results {
        if let Some(output) = output {
            out.push_str(&format!("\n== {task} ==\n{}\n", render_output(output)));
        }
    }
    out
}

/// The human-readable part of a worker's output.
fn render_output(output: &Value) -> String {
    for field in ["content", "dialog", "summary"] {
        if let Some(text) = output[field].as_str() {
            return text.to_string();
        }
    }
    let joined = |field: &str| {
        output[field]
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", "))
    };
    if let (Some(themes), Some(audience)) = (joined("themes"), output["audience"].as_str()) {
        return format!("themes: {themes}\naudience: {audience}");
    }
    match (joined("keywords"), joined("hashtags")) {
        (Some(k), Some(h)) => format!("keywords: {k}\nhashtags: {h}"),
        _ => serde_json::to_string_pretty(output).unwrap_or_default(),
    }
}
