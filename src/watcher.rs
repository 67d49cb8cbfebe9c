use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::camera_service::CameraService;
use crate::config::{camera_id_from_path, load_camera_file};
use crate::errors::{CameraError, Result};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watch `cameras_dir` and keep the service's cameras in step with its files.
pub fn start_camera_config_watcher(service: Arc<CameraService>, cameras_dir: &str) -> Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::channel(100);

    let mut watcher = RecommendedWatcher::new(
        move |res| match res {
            Ok(event) => {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watcher event: {}", e);
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        },
        NotifyConfig::default(),
    )
    .map_err(|e| CameraError::config(format!("File watcher error: {}", e)))?;

    let cameras_dir_path = Path::new(cameras_dir);
    if !cameras_dir_path.exists() {
        info!("Creating cameras directory '{}' for watching...", cameras_dir);
        fs::create_dir_all(cameras_dir_path)?;
    }

    watcher
        .watch(cameras_dir_path, RecursiveMode::NonRecursive)
        .map_err(|e| CameraError::config(format!("Failed to watch cameras directory: {}", e)))?;
    info!("Started watching cameras directory '{}' for configuration changes", cameras_dir);

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        let mut last_events: HashMap<String, Instant> = HashMap::new();

        while let Some(event) = rx.recv().await {
            // Editors emit bursts of events per save; act once per camera
            let should_process = match event.paths.first().and_then(|p| camera_id_from_path(p)) {
                Some(camera_id) => {
                    let now = Instant::now();
                    let fresh = last_events
                        .get(&camera_id)
                        .map_or(true, |last| now.duration_since(*last) >= DEBOUNCE);
                    if fresh {
                        last_events.insert(camera_id, now);
                    }
                    fresh
                }
                None => false,
            };

            if should_process {
                apply_file_event(&service, event).await;
            }
        }
    }))
}

/// Apply one filesystem event to the service.
pub async fn apply_file_event(service: &CameraService, event: Event) {
    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths {
                if let Some(camera_id) = camera_id_from_path(&path) {
                    info!("Detected new camera configuration: {}", camera_id);
                    load_and_register(service, &path, false).await;
                }
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths {
                if let Some(camera_id) = camera_id_from_path(&path) {
                    info!("Detected camera configuration change: {}", camera_id);
                    load_and_register(service, &path, true).await;
                }
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                if let Some(camera_id) = camera_id_from_path(&path) {
                    info!("Detected camera configuration removal: {}", camera_id);
                    if !service.remove_camera(&camera_id).await {
                        warn!("Camera '{}' was not registered", camera_id);
                    }
                }
            }
        }
        _ => {}
    }
}

async fn load_and_register(service: &CameraService, path: &Path, replace: bool) {
    let camera_config = match load_camera_file(path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load camera config {}: {}", path.display(), e);
            return;
        }
    };
    let camera_id = camera_config.id.clone();

    if !camera_config.is_enabled() {
        info!("Camera '{}' is disabled, removing it if registered", camera_id);
        service.remove_camera(&camera_id).await;
        return;
    }

    let result = if replace {
        service.reregister_camera(camera_config).await
    } else {
        match service.register_camera(camera_config.clone()).await {
            // A create event for a file we already loaded at startup
            Err(CameraError::AlreadyRegistered { .. }) => service.reregister_camera(camera_config).await,
            other => other,
        }
    };

    match result {
        Ok(()) => info!("Camera '{}' configured from {}", camera_id, path.display()),
        Err(CameraError::Validation { message }) => {
            warn!("Camera '{}' registered but not reachable: {}", camera_id, message)
        }
        Err(e) => error!("Failed to configure camera '{}': {}", camera_id, e),
    }
}
