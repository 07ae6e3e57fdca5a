use anyhow::{Context, Result};
use nier_relay::config::{self, LoggingConfig};
use nier_relay::{
    start_api_server, AppState, BoxOverlayRenderer, ConnectionManager, FrameEncoder, FrameHub,
    RelayConfig,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    let run_mode = config::run_mode();
    info!(
        service = "nier-relay",
        version = env!("CARGO_PKG_VERSION"),
        run_mode = %run_mode,
        "Starting camera relay service"
    );

    // Validate configuration
    config.validate()?;

    if let Some(port) = config.server.metrics_port {
        init_metrics(port)?;
    }

    let hub = Arc::new(FrameHub::with_limits(
        config.stream.channel_capacity,
        config.stream.max_cameras,
    ));
    let settings = config.manager_settings(&run_mode);
    info!(
        policy = ?settings.policy,
        reconnect_delay_secs = settings.reconnect_delay.as_secs(),
        "Camera reconnect policy"
    );
    let manager = Arc::new(ConnectionManager::new(hub.clone(), settings));

    if config.cameras_enabled() {
        let descriptors = config.descriptors();
        info!(cameras = descriptors.len(), "Starting camera connections");
        manager.start_all(descriptors);
    } else {
        info!("Camera subsystem disabled; serving pushed frames only");
    }

    let api_state = AppState {
        hub,
        manager: manager.clone(),
        renderer: Arc::new(BoxOverlayRenderer::new(config.box_style())),
        encoder: FrameEncoder::new(config.stream.boundary.clone()),
        sink_buffer_frames: config.stream.sink_buffer_frames,
    };

    // Spawn API server task
    let server_config = config.server.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &server_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Relay service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down relay service");

    for (camera, stats) in manager.shutdown() {
        info!(
            app_id = %camera.app_id,
            camera_id = %camera.camera_id,
            frames_received = stats.frames_received,
            frames_dropped = stats.frames_dropped,
            bytes_received = stats.bytes_received,
            reconnect_count = stats.reconnect_count,
            "Camera final stats"
        );
    }

    api_handle.abort();

    info!("Relay service stopped");

    Ok(())
}

/// Load configuration.
fn load_config() -> Result<RelayConfig> {
    // Try loading from files first, fall back to environment
    let config = RelayConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        RelayConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("nier_relay={}", level).parse()?)
        .add_directive("tower_http=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
