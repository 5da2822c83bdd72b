use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use flag_events::diagnostic::DiagnosticStore;
use flag_events::event::CustomEvent;
use flag_events::{Config, Context as FlagContext, EventProcessor, HttpEventSender, SdkDiagnosticParams};

/// Analytics event pipeline for feature-flag SDKs.
#[derive(Parser)]
#[command(name = "flag-events", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Deliver a single custom event and exit.
    SendCustom {
        /// Key of the context the event is attributed to.
        #[arg(long)]
        context_key: String,

        /// Custom event key.
        #[arg(long)]
        event_key: String,

        /// Context kind.
        #[arg(long, default_value = "user")]
        kind: String,

        /// Optional JSON data attached to the event.
        #[arg(long)]
        data: Option<String>,

        /// Optional numeric metric value.
        #[arg(long)]
        metric: Option<f64>,
    },
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Some(Command::Version) | None => {
            println!("flag-events {}", version::full());
            return Ok(());
        }
        Some(command) => command,
    };

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, command))
}

async fn run(cfg: Config, command: Command) -> Result<()> {
    let Command::SendCustom {
        context_key,
        event_key,
        kind,
        data,
        metric,
    } = command
    else {
        return Ok(());
    };

    let data = data
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .context("parsing --data as JSON")?;

    let sender = Arc::new(HttpEventSender::new(cfg.http.clone())?);
    let mut builder = EventProcessor::builder(cfg.events.clone(), sender);
    if !cfg.sdk_key.is_empty() {
        let store = DiagnosticStore::new(SdkDiagnosticParams {
            sdk_key: cfg.sdk_key.clone(),
            sdk_name: "flag-events".to_string(),
            sdk_version: version::RELEASE.to_string(),
            platform_name: "Rust".to_string(),
            ..Default::default()
        });
        builder = builder.diagnostic_store(Arc::new(store));
    }
    let processor = builder.start()?;

    let mut event = CustomEvent::new(&event_key, FlagContext::new(&kind, &context_key));
    event.data = data.unwrap_or(Value::Null);
    event.metric_value = metric;

    tracing::info!(event = %event_key, context = %context_key, "sending custom event");
    processor.send_event(event);
    processor.close().await;

    tracing::info!("flag-events stopped");

    Ok(())
}
