//! Upstream connection management for one camera.
//!
//! The connector runs as a single task that owns the camera connection and
//! the stream buffer. It reports everything it does to a
//! [`ConnectorObserver`]; it never touches viewers or status directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, DeliveryMode, StreamSettings};
use crate::demux::{frame_payload, FrameDemuxer};
use crate::errors::{CameraError, Result};
use crate::upstream::{ByteStream, CameraSource};

pub const BACKOFF_BASE: Duration = Duration::from_millis(1000);
pub const BACKOFF_CAP: Duration = Duration::from_millis(30_000);

/// Delay before the reconnect that follows `failures` earlier consecutive
/// failures: 1s, 2s, 4s, ... capped at 30s.
pub fn backoff_delay(failures: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(failures))
        .min(BACKOFF_CAP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Connecting { attempt: u32 },
    Connected,
    Frame(Bytes),
    /// The connection attempt or the open connection failed.
    Error { message: String },
    /// The upstream closed the connection.
    Ended,
    ReconnectScheduled { delay: Duration },
    /// Retries are exhausted; the connector has stopped.
    GaveUp { message: String },
}

pub trait ConnectorObserver: Send + Sync {
    fn on_connector_event(&self, event: ConnectorEvent);
}

enum SessionEnd {
    /// Never got a response.
    ConnectFailed(CameraError),
    /// Was connected, then the connection went away.
    Dropped(Option<CameraError>),
}

pub struct UpstreamConnector {
    camera: Arc<CameraConfig>,
    source: Arc<dyn CameraSource>,
    settings: StreamSettings,
    observer: Arc<dyn ConnectorObserver>,
    state: Mutex<ConnectorState>,
    attempts: AtomicU32,
}

impl UpstreamConnector {
    pub fn new(
        camera: Arc<CameraConfig>,
        source: Arc<dyn CameraSource>,
        settings: StreamSettings,
        observer: Arc<dyn ConnectorObserver>,
    ) -> Self {
        Self {
            camera,
            source,
            settings,
            observer,
            state: Mutex::new(ConnectorState::Disconnected),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consecutive failed connection attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Mark the connector stopped; used when its task is aborted from outside.
    pub fn mark_disconnected(&self) {
        self.enter(ConnectorState::Disconnected);
    }

    fn enter(&self, state: ConnectorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn emit(&self, event: ConnectorEvent) {
        self.observer.on_connector_event(event);
    }

    /// Connect, stream, and reconnect until retries run out. Every run starts
    /// with a fresh retry budget.
    ///
    /// The task running this is aborted to close the connection; that also
    /// cancels any pending reconnect since only one sleep is ever in flight.
    pub async fn run(&self) {
        let camera_id = &self.camera.id;
        let mut demuxer = FrameDemuxer::new(self.camera.mode);
        let mut failures = 0;
        self.attempts.store(0, Ordering::Relaxed);

        info!("Starting camera stream for: {}", camera_id);

        loop {
            self.enter(ConnectorState::Connecting);
            self.emit(ConnectorEvent::Connecting { attempt: failures + 1 });
            debug!(camera_id = %camera_id, attempt = failures + 1, "Connecting to camera");

            let session = match self.camera.mode {
                DeliveryMode::ContinuousStream => self.stream_session(&mut demuxer, &mut failures).await,
                DeliveryMode::PollSnapshot => self.poll_session(&mut demuxer, &mut failures).await,
            };
            demuxer.reset();

            let delay = match session {
                SessionEnd::ConnectFailed(e) => {
                    failures += 1;
                    self.attempts.store(failures, Ordering::Relaxed);
                    let message = e.to_string();
                    error!("Camera connection failed for {}: {}", camera_id, message);
                    self.emit(ConnectorEvent::Error { message: message.clone() });

                    if failures >= self.camera.retry_attempts {
                        warn!("Max retry attempts ({}) reached for camera {}", self.camera.retry_attempts, camera_id);
                        self.enter(ConnectorState::Disconnected);
                        self.emit(ConnectorEvent::GaveUp {
                            message: format!("Max retry attempts reached for camera {}: {}", camera_id, message),
                        });
                        return;
                    }
                    backoff_delay(failures - 1)
                }
                SessionEnd::Dropped(Some(e)) => {
                    error!("Camera stream error for {}: {}", camera_id, e);
                    self.emit(ConnectorEvent::Error { message: e.to_string() });
                    backoff_delay(failures)
                }
                SessionEnd::Dropped(None) => {
                    warn!("Camera stream ended for {}", camera_id);
                    self.emit(ConnectorEvent::Ended);
                    backoff_delay(failures)
                }
            };

            info!(camera_id = %camera_id, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            self.enter(ConnectorState::ReconnectScheduled);
            self.emit(ConnectorEvent::ReconnectScheduled { delay });
            sleep(delay).await;
        }
    }

    fn connected(&self, failures: &mut u32) {
        *failures = 0;
        self.attempts.store(0, Ordering::Relaxed);
        self.enter(ConnectorState::Connected);
        info!("Camera stream connected: {}", self.camera.id);
        self.emit(ConnectorEvent::Connected);
    }

    async fn stream_session(&self, demuxer: &mut FrameDemuxer, failures: &mut u32) -> SessionEnd {
        let mut body = match self.source.open(self.camera.upstream_url(), &self.camera).await {
            Ok(body) => body,
            Err(e) => return SessionEnd::ConnectFailed(e),
        };
        self.connected(failures);

        let mut frame_count = 0u64;
        loop {
            let chunk = match self.next_chunk(&mut body).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return SessionEnd::Dropped(None),
                Err(e) => return SessionEnd::Dropped(Some(e)),
            };

            for segment in demuxer.feed(&chunk) {
                if let Some(frame) = frame_payload(segment) {
                    frame_count += 1;
                    if frame_count % 100 == 0 {
                        debug!("Streamed {} frames from camera {}", frame_count, self.camera.id);
                    }
                    self.emit(ConnectorEvent::Frame(frame));
                }
            }

            if demuxer.buffered_len() > self.settings.max_buffer_bytes {
                return SessionEnd::Dropped(Some(CameraError::BufferOverflow {
                    limit: self.settings.max_buffer_bytes,
                }));
            }
        }
    }

    /// Repeated single-image GETs. The first success counts as connecting;
    /// a later failure is handled like a dropped stream.
    async fn poll_session(&self, demuxer: &mut FrameDemuxer, failures: &mut u32) -> SessionEnd {
        let mut connected = false;
        loop {
            match self.fetch_image().await {
                Ok(image) => {
                    if !connected {
                        connected = true;
                        self.connected(failures);
                    }
                    for frame in demuxer.feed(&image) {
                        self.emit(ConnectorEvent::Frame(frame));
                    }
                }
                Err(e) if connected => return SessionEnd::Dropped(Some(e)),
                Err(e) => return SessionEnd::ConnectFailed(e),
            }
            sleep(self.camera.poll_interval()).await;
        }
    }

    async fn fetch_image(&self) -> Result<Bytes> {
        let mut body = self.source.open(self.camera.upstream_url(), &self.camera).await?;
        let mut image = BytesMut::new();
        while let Some(chunk) = self.next_chunk(&mut body).await? {
            image.extend_from_slice(&chunk);
            if image.len() > self.settings.max_buffer_bytes {
                return Err(CameraError::BufferOverflow {
                    limit: self.settings.max_buffer_bytes,
                });
            }
        }
        Ok(image.freeze())
    }

    async fn next_chunk(&self, body: &mut ByteStream) -> Result<Option<Bytes>> {
        let stall = self.settings.stall_timeout();
        match timeout(stall, body.next()).await {
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(CameraError::upstream(format!(
                "no data from camera for {}s",
                stall.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u128> = (0..9).map(|n| backoff_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000, 30000]);
    }

    #[test]
    fn test_backoff_saturates_for_huge_counts() {
        assert_eq!(backoff_delay(64), BACKOFF_CAP);
        assert_eq!(backoff_delay(u32::MAX), BACKOFF_CAP);
    }
}
