use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::camera_stream::{CameraStream, ViewerHandle};
use crate::client_registry::{ClientInfo, ViewerSink};
use crate::config::{CameraConfig, StreamSettings};
use crate::errors::{CameraError, Result};
use crate::events::CameraEvent;
use crate::status::{CameraState, CameraStatus, StatusHandle};
use crate::upstream::CameraSource;

/// How long a fetched snapshot is served from cache.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct CachedSnapshot {
    data: Bytes,
    fetched_at: Instant,
}

struct CameraEntry {
    config: Arc<CameraConfig>,
    status: StatusHandle,
    /// Created by the first viewer attach.
    stream: Option<Arc<CameraStream>>,
    /// Held across the upstream fetch so concurrent requests share it.
    snapshot: Arc<Mutex<Option<CachedSnapshot>>>,
}

/// Registered cameras and their live streams.
///
/// Constructed once in `main` and shared as `Arc<CameraService>`; call
/// [`CameraService::shutdown`] before the process exits.
pub struct CameraService {
    source: Arc<dyn CameraSource>,
    settings: StreamSettings,
    cameras: RwLock<HashMap<String, CameraEntry>>,
    events: broadcast::Sender<CameraEvent>,
    shut_down: AtomicBool,
    started_at: Instant,
}

impl CameraService {
    pub fn new(source: Arc<dyn CameraSource>, settings: StreamSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source,
            settings,
            cameras: RwLock::new(HashMap::new()),
            events,
            shut_down: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn camera_count(&self) -> usize {
        self.cameras.read().await.len()
    }

    /// Validate, probe and store a camera.
    ///
    /// A camera that fails the probe is still stored (status `offline`) and
    /// the failure is returned as [`CameraError::Validation`].
    pub async fn register_camera(&self, config: CameraConfig) -> Result<()> {
        if self.is_shut_down() {
            return Err(CameraError::ShutDown);
        }
        config.validate()?;
        if self.cameras.read().await.contains_key(&config.id) {
            return Err(CameraError::AlreadyRegistered { camera_id: config.id });
        }

        info!("Registering camera '{}' ({})", config.id, config.stream_url);
        let probe = self.source.probe(&config).await;

        let camera_id = config.id.clone();
        {
            let mut cameras = self.cameras.write().await;
            if self.is_shut_down() {
                return Err(CameraError::ShutDown);
            }
            // Another registration may have won while we were probing
            if cameras.contains_key(&camera_id) {
                return Err(CameraError::AlreadyRegistered { camera_id });
            }

            let status = match &probe {
                Ok(()) => StatusHandle::new(&camera_id, CameraState::Online, self.events.clone()),
                Err(e) => {
                    let status = StatusHandle::new(&camera_id, CameraState::Offline, self.events.clone());
                    status.transition(CameraState::Offline, Some(e.to_string()));
                    status
                }
            };
            cameras.insert(
                camera_id.clone(),
                CameraEntry {
                    config: Arc::new(config),
                    status,
                    stream: None,
                    snapshot: Arc::new(Mutex::new(None)),
                },
            );
        }
        let _ = self.events.send(CameraEvent::Added {
            camera_id: camera_id.clone(),
        });

        match probe {
            Ok(()) => {
                info!("Camera '{}' registered and online", camera_id);
                Ok(())
            }
            Err(e) => {
                warn!("Camera '{}' registered but unreachable: {}", camera_id, e);
                Err(CameraError::validation(e.to_string()))
            }
        }
    }

    /// Replace a camera's configuration. Its stream (and every viewer on it)
    /// is closed first. An invalid replacement leaves the camera as it was.
    pub async fn reregister_camera(&self, config: CameraConfig) -> Result<()> {
        config.validate()?;
        if self.remove_camera(&config.id).await {
            info!("Re-registering camera '{}'", config.id);
        }
        self.register_camera(config).await
    }

    /// Attach a viewer, creating the camera's stream on first use.
    pub async fn attach_viewer(
        &self,
        camera_id: &str,
        client_id: String,
        sink: Box<dyn ViewerSink>,
    ) -> Result<ViewerHandle> {
        if self.is_shut_down() {
            sink.close();
            return Err(CameraError::ShutDown);
        }

        let stream = {
            let mut cameras = self.cameras.write().await;
            // shutdown() sets the flag before it drains streams under this lock
            if self.is_shut_down() {
                sink.close();
                return Err(CameraError::ShutDown);
            }
            let Some(entry) = cameras.get_mut(camera_id) else {
                sink.close();
                return Err(CameraError::not_found(camera_id));
            };
            match &entry.stream {
                Some(stream) => stream.clone(),
                None => {
                    let stream = CameraStream::new(
                        entry.config.clone(),
                        self.source.clone(),
                        &self.settings,
                        entry.status.clone(),
                        self.events.clone(),
                    );
                    entry.stream = Some(stream.clone());
                    stream
                }
            }
        };

        stream.attach(client_id, sink)
    }

    /// Returns false if the camera or client is unknown.
    pub async fn detach_viewer(&self, camera_id: &str, client_id: &str) -> bool {
        let stream = {
            let cameras = self.cameras.read().await;
            cameras.get(camera_id).and_then(|entry| entry.stream.clone())
        };
        stream.is_some_and(|stream| stream.detach(client_id))
    }

    /// Latest still image, from cache if fetched within [`SNAPSHOT_TTL`].
    pub async fn get_snapshot(&self, camera_id: &str) -> Result<Bytes> {
        let (config, status, snapshot) = {
            let cameras = self.cameras.read().await;
            let entry = cameras.get(camera_id).ok_or_else(|| CameraError::not_found(camera_id))?;
            (entry.config.clone(), entry.status.clone(), entry.snapshot.clone())
        };

        let mut cached = snapshot.lock().await;
        if let Some(snapshot) = cached.as_ref() {
            if snapshot.fetched_at.elapsed() < SNAPSHOT_TTL {
                debug!("Serving cached snapshot for camera '{}'", camera_id);
                return Ok(snapshot.data.clone());
            }
        }

        match self.source.fetch(config.snapshot_url(), &config).await {
            Ok(data) => {
                *cached = Some(CachedSnapshot {
                    data: data.clone(),
                    fetched_at: Instant::now(),
                });
                status.transition(CameraState::Online, None);
                Ok(data)
            }
            Err(e) => {
                warn!("Snapshot fetch failed for camera '{}': {}", camera_id, e);
                status.transition(CameraState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Close the camera's stream and forget it. Returns false if unknown.
    pub async fn remove_camera(&self, camera_id: &str) -> bool {
        let Some(entry) = self.cameras.write().await.remove(camera_id) else {
            return false;
        };
        if let Some(stream) = entry.stream {
            stream.close();
        }
        info!("Camera '{}' removed", camera_id);
        let _ = self.events.send(CameraEvent::Removed {
            camera_id: camera_id.to_string(),
        });
        true
    }

    /// Close every stream and viewer. Registered configurations are kept.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let streams: Vec<Arc<CameraStream>> = {
            let mut cameras = self.cameras.write().await;
            cameras.values_mut().filter_map(|entry| entry.stream.take()).collect()
        };
        info!("Shutting down camera service, closing {} streams", streams.len());
        for stream in streams {
            stream.close();
        }
    }

    pub async fn get_status(&self, camera_id: &str) -> Option<CameraStatus> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|entry| entry.status.snapshot())
    }

    /// Statuses of every registered camera, ordered by id.
    pub async fn list_statuses(&self) -> Vec<CameraStatus> {
        let cameras = self.cameras.read().await;
        let mut statuses: Vec<CameraStatus> = cameras.values().map(|entry| entry.status.snapshot()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Registered configurations with credentials redacted, ordered by id.
    pub async fn list_cameras(&self) -> Vec<CameraConfig> {
        let cameras = self.cameras.read().await;
        let mut configs: Vec<CameraConfig> = cameras.values().map(|entry| entry.config.redacted()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    /// Viewers attached to a camera; empty until its stream exists.
    pub async fn clients(&self, camera_id: &str) -> Result<Vec<ClientInfo>> {
        let cameras = self.cameras.read().await;
        let entry = cameras.get(camera_id).ok_or_else(|| CameraError::not_found(camera_id))?;
        Ok(entry.stream.as_ref().map(|stream| stream.clients()).unwrap_or_default())
    }
}
