//! umr-pipeline - Utility meter reading service
//!
//! Periodically photographs each configured meter, transcribes the image
//! through the vision provider chain, validates the reading against history,
//! archives the snapshot, appends to the per-type reading log and forwards
//! the reading to the time-series database.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use umr_common::config::{
    default_config_path, RootFolderInitializer, RootFolderResolver, TomlConfig,
};

use umr_pipeline::workflow::{PipelineEvent, Scheduler, SinkOutcome};
use umr_pipeline::AppState;

/// Pipeline event channel capacity
const EVENT_CAPACITY: usize = 100;

/// Command-line arguments for umr-pipeline
#[derive(Parser, Debug)]
#[command(name = "umr-pipeline")]
#[command(about = "Utility meter reading pipeline")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "UMR_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder for archive and logs
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Run every meter once and exit
    #[arg(long)]
    once: bool,

    /// Address for the administrative HTTP server (overrides [server] bind)
    #[arg(long)]
    bind: Option<String>,

    /// Log level filter (overrides RUST_LOG and [logging] level)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    init_tracing(&config, args.log_level.as_deref())?;

    info!("Starting umr-pipeline");
    info!(
        "Version: {} ({}, {} build {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE"),
        env!("BUILD_TIMESTAMP")
    );

    // Resolve and initialize root folder
    let root_folder = RootFolderResolver::new()
        .with_cli_arg(args.root_folder.clone())
        .with_toml_value(config.root_folder.clone())
        .resolve();
    let layout = RootFolderInitializer::new(root_folder);
    layout
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", layout.root().display());

    // Assemble pipeline
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let orchestrator = Arc::new(
        umr_pipeline::config::build_orchestrator(&config, &layout)
            .context("Failed to assemble pipeline")?
            .with_events(event_tx),
    );

    let report = orchestrator
        .reconcile()
        .await
        .context("Archive reconciliation failed")?;
    if report.orphans_quarantined > 0 {
        warn!(
            orphans_quarantined = report.orphans_quarantined,
            "Quarantined archive entries from runs that never reached the log"
        );
    }

    let state = AppState::new(Arc::clone(&orchestrator));
    tokio::spawn(consume_events(event_rx, state.clone()));

    if args.once {
        return run_once(&state).await;
    }

    let cancel_token = CancellationToken::new();
    let scheduler = tokio::spawn(Scheduler::new(Arc::clone(&orchestrator), cancel_token.clone()).run());

    if config.server.enabled {
        let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
        let app = umr_pipeline::build_router(state);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind to {}", bind))?;
        info!("Listening on http://{}", bind);
        info!("Health check: http://{}/health", bind);

        let server_token = cancel_token.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                server_token.cancel();
            })
            .await
            .context("Server error")?;
    } else {
        info!("Administrative HTTP server disabled");
        shutdown_signal().await;
        cancel_token.cancel();
    }

    // In-flight runs finish before the scheduler returns
    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task failed");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load the TOML configuration
///
/// An explicit path must exist. Without one, the default location is used if
/// present, otherwise an empty configuration.
fn load_config(path: Option<&std::path::Path>) -> Result<TomlConfig> {
    if let Some(path) = path {
        return TomlConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    match default_config_path() {
        Some(path) if path.exists() => TomlConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        _ => {
            eprintln!("No configuration file found, starting without meters");
            Ok(TomlConfig::default())
        }
    }
}

/// Initialize tracing
///
/// Filter priority: `--log-level`, then `RUST_LOG`, then `[logging] level`.
fn init_tracing(config: &TomlConfig, cli_level: Option<&str>) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::try_new(level).context("Invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "umr_pipeline={level},umr_common={level},tower_http=info",
                level = config.logging.level
            ))
        }),
    };

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// Run every meter once, waiting for sink writes before returning
async fn run_once(state: &AppState) -> Result<()> {
    let mut failed = Vec::new();

    for meter in state.orchestrator.meters() {
        match state.orchestrator.run(&meter.name).await {
            Ok(report) => {
                println!(
                    "{}: {} ({}){}",
                    report.meter_name,
                    report.reading.total_reading(),
                    report.reading.confidence(),
                    report
                        .validation_warning
                        .map(|w| format!(" [{}]", w))
                        .unwrap_or_default()
                );
                if let SinkOutcome::Failed(reason) = report.sink.outcome().await {
                    debug!(meter = %meter.name, reason = %reason, "Sink write not completed");
                }
            }
            Err(e) => {
                println!("{}: FAILED {}", meter.name, e);
                failed.push(meter.name.clone());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} meter run(s) failed: {}", failed.len(), failed.join(", "))
    }
}

/// Record run failures for the health endpoint and trace progress
async fn consume_events(mut event_rx: mpsc::Receiver<PipelineEvent>, state: AppState) {
    while let Some(event) = event_rx.recv().await {
        match event {
            PipelineEvent::RunFailed { meter, message, .. } => {
                *state.last_error.write().await = Some(format!("{}: {}", meter, message));
            }
            PipelineEvent::StateChanged { meter, to, .. } => {
                debug!(meter = %meter, state = %to, "Run progress");
            }
            PipelineEvent::SinkFinished { meter, outcome, .. } => {
                debug!(meter = %meter, outcome = ?outcome, "Sink finished");
            }
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
