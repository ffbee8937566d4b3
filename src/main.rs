//! vigil — multi-camera motion-activated video recorder
//!
//! Usage:
//!   vigil run --config config.toml

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vigil::api;
use vigil::config::Config;
use vigil::events::EventBus;
use vigil::hub::WsHub;
use vigil::janitor::StorageJanitor;
use vigil::registry::CameraRegistry;

/// Queue depth between workers and the WebSocket hub.
const EVENT_CHANNEL_DEPTH: usize = 256;

#[derive(Parser)]
#[command(name = "vigil", about = "Motion-activated video recorder", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start monitoring all configured cameras.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            if let Err(e) = run(config).await {
                error!(error = %e, "Fatal error");
                std::process::exit(1);
            }
        }
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            // Logging is not configured yet at this point.
            eprintln!("Failed to load config {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    // Keep the file-appender guard alive for the process lifetime.
    let _log_guard = init_logging(&cfg);

    info!(
        http = format!("{}:{}", cfg.http.host, cfg.http.port),
        websocket = format!("{}:{}", cfg.websocket.host, cfg.websocket.port),
        recordings = %cfg.recording.recordings_dir.display(),
        cameras = cfg.cameras.len(),
        "Starting vigil"
    );

    let shutdown = CancellationToken::new();
    let (bus, events_rx) = EventBus::channel(EVENT_CHANNEL_DEPTH);

    let cfg = Arc::new(cfg);
    let registry = Arc::new(CameraRegistry::new(cfg.clone(), bus));

    for cam in &cfg.cameras {
        if let Err(e) = registry.add(&cam.id, &cam.url) {
            warn!(camera = cam.id, error = %e, "Failed to start configured camera");
        }
    }

    let mut janitor = StorageJanitor::new(
        cfg.recording.recordings_dir.clone(),
        cfg.recording.cleanup_days,
    );
    janitor.start();

    let hub = WsHub::new(shutdown.clone());
    let ws_host = cfg.websocket.host.clone();
    let ws_port = cfg.websocket.port;
    let mut hub_task = tokio::spawn(async move { hub.serve(&ws_host, ws_port, events_rx).await });

    let api_state = Arc::new(api::AppState { registry: registry.clone() });
    let http_host = cfg.http.host.clone();
    let http_port = cfg.http.port;
    let http_shutdown = shutdown.clone();
    let mut http_task = tokio::spawn(async move {
        api::start_server(api_state, &http_host, http_port, http_shutdown).await
    });

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Signal handler failed")?;
            info!("Received CTRL+C, shutting down…");
        }
        res = &mut hub_task => {
            let inner = res.context("WebSocket hub task panicked")?;
            inner.context("WebSocket hub failed")?;
            anyhow::bail!("WebSocket hub exited unexpectedly");
        }
        res = &mut http_task => {
            let inner = res.context("HTTP API task panicked")?;
            inner.context("HTTP API failed")?;
            anyhow::bail!("HTTP API exited unexpectedly");
        }
    }

    registry.stop_all().await;
    shutdown.cancel();
    janitor.stop().await;

    let drain = Duration::from_secs(5);
    let _ = tokio::time::timeout(drain, &mut hub_task).await;
    let _ = tokio::time::timeout(drain, &mut http_task).await;

    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing from config; returns the appender guard when logging
/// to a file.
fn init_logging(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log.level.clone()));

    match &cfg.log.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "vigil.log".into());
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
