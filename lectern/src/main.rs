use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lectern_api::{create_router, AppState};
use lectern_core::room::{RoomMessageHub, RoomRegistry, RoomService};
use lectern_core::{logging, Config};
use lectern_livestream::{CleanupScheduler, FfmpegLauncher, StreamOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "lectern", about = "Live-classroom streaming origin")]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "LECTERN_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        anyhow::bail!(
            "configuration validation failed with {} error(s)",
            errors.len()
        );
    }
    let config = Arc::new(config);

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Lectern starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        "Expecting RTMP ingest on port {} (app '{}')",
        config.ingest.rtmp_port, config.ingest.app_name
    );

    // 3. Output directories must exist and be writable before first publish
    for dir in [
        &config.streaming.streams_dir,
        &config.streaming.recordings_dir,
    ] {
        tokio::fs::create_dir_all(Path::new(dir))
            .await
            .with_context(|| format!("failed to create directory {dir}"))?;
    }

    // 4. Wire services: room hub, transcoder launcher, orchestrator
    let rooms = Arc::new(RoomService::new(
        RoomRegistry::new(),
        RoomMessageHub::new(),
        config.room.chat_retention,
    ));

    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(FfmpegLauncher::new(
        config.streaming.ffmpeg_binary.clone(),
        exit_tx,
    ));
    let cleanup = Arc::new(CleanupScheduler::new(
        config.streaming.streams_dir.clone().into(),
        Duration::from_secs(config.streaming.cleanup_grace_seconds),
    ));
    let orchestrator = StreamOrchestrator::new(config.clone(), launcher, rooms.clone(), cleanup);
    let exit_listener = orchestrator.start_exit_listener(exit_rx);

    // 5. HTTP server: ingest hooks, WebSocket rooms, HLS surface
    let router = create_router(AppState {
        config: config.clone(),
        rooms,
        orchestrator,
    });

    let listener = tokio::net::TcpListener::bind(config.http_address())
        .await
        .with_context(|| format!("failed to bind {}", config.http_address()))?;
    info!("Listening on http://{}", config.http_address());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down");
    exit_listener.abort();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => warn!("Failed to listen for shutdown signal: {e}"),
    }
}
