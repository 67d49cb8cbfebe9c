use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures_util::future::join_all;
use tracing::{error, info, warn};

use camera_relay::config::Config;
use camera_relay::handlers::router;
use camera_relay::upstream::HttpCameraSource;
use camera_relay::watcher::start_camera_config_watcher;
use camera_relay::{CameraError, CameraService};

#[derive(Parser, Debug)]
#[command(name = "camera-relay")]
#[command(about = "Relays HTTP camera streams to many viewers over one upstream connection each")]
struct Args {
    /// Path to the configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("camera_relay=debug,info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        Config::default()
    });
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("Starting camera relay on {}:{}", config.server.host, config.server.port);

    let source = Arc::new(HttpCameraSource::new()?);
    let service = Arc::new(CameraService::new(source, config.stream.clone()));

    let registrations = config
        .cameras
        .values()
        .filter(|camera| {
            if !camera.is_enabled() {
                info!("Camera '{}' is disabled, skipping", camera.id);
            }
            camera.is_enabled()
        })
        .map(|camera| {
            let service = service.clone();
            let camera = camera.clone();
            async move {
                let camera_id = camera.id.clone();
                match service.register_camera(camera).await {
                    Ok(()) => info!("Camera '{}' ready", camera_id),
                    Err(CameraError::Validation { message }) => {
                        warn!("Camera '{}' is offline: {}", camera_id, message)
                    }
                    Err(e) => error!("Failed to register camera '{}': {}", camera_id, e),
                }
            }
        });
    join_all(registrations).await;

    if config.cameras.is_empty() {
        warn!("No cameras configured; add them through the API or the cameras directory");
    }

    let _watcher = match &config.server.cameras_directory {
        Some(cameras_dir) => match start_camera_config_watcher(service.clone(), cameras_dir) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start camera config watcher: {}", e);
                None
            }
        },
        None => None,
    };

    let app = router(service.clone(), config.server.cors_allow_origin.as_deref());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("Camera relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, closing camera streams");
}
