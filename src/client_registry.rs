use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::errors::{CameraError, Result};
use crate::mjpeg::StreamPreamble;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    #[error("viewer sink is closed")]
    Closed,
    #[error("viewer sink queue is full")]
    Full,
}

/// Destination for one viewer's multipart stream.
///
/// Writes must not block: a sink that cannot take a part right now returns
/// [`SinkError::Full`] and the frame is skipped for that viewer only.
pub trait ViewerSink: Send + Sync {
    /// Deliver the stream preamble (content type and boundary).
    fn begin(&self, preamble: &StreamPreamble) -> std::result::Result<(), SinkError>;

    /// Deliver one part header followed by its frame bytes.
    fn write_part(&self, header: Bytes, frame: Bytes) -> std::result::Result<(), SinkError>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

pub struct Client {
    pub id: String,
    sink: Box<dyn ViewerSink>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub frames_sent: u64,
    pub frames_skipped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub frames_sent: u64,
    pub frames_skipped: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub skipped: usize,
    pub removed: Vec<String>,
}

/// Attached viewers of one camera, in attach order.
pub struct ClientRegistry {
    camera_id: String,
    clients: Vec<Client>,
}

impl ClientRegistry {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            clients: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.iter().any(|c| c.id == client_id)
    }

    pub fn attach(&mut self, client_id: String, sink: Box<dyn ViewerSink>, preamble: &StreamPreamble) -> Result<()> {
        if self.contains(&client_id) {
            sink.close();
            return Err(CameraError::DuplicateClient {
                camera_id: self.camera_id.clone(),
                client_id,
            });
        }

        if let Err(e) = sink.begin(preamble) {
            sink.close();
            return Err(e.into());
        }

        let now = Utc::now();
        info!(camera_id = %self.camera_id, client_id = %client_id, "Client connected to camera stream");
        self.clients.push(Client {
            id: client_id,
            sink,
            connected_at: now,
            last_activity: now,
            frames_sent: 0,
            frames_skipped: 0,
        });
        Ok(())
    }

    /// Remove and close a client. Returns false if it was not attached.
    pub fn detach(&mut self, client_id: &str) -> bool {
        let Some(index) = self.clients.iter().position(|c| c.id == client_id) else {
            return false;
        };
        let client = self.clients.remove(index);
        client.sink.close();
        info!(
            "Client {} disconnected from camera stream {} (sent: {}, skipped: {})",
            client.id, self.camera_id, client.frames_sent, client.frames_skipped
        );
        true
    }

    /// Detach every client, returning their ids.
    pub fn clear(&mut self) -> Vec<String> {
        let ids = self.clients.iter().map(|c| c.id.clone()).collect();
        for client in self.clients.drain(..) {
            client.sink.close();
        }
        ids
    }

    /// Write one frame to every client.
    ///
    /// A client whose sink is closed or fails the write is removed on the
    /// spot; the remaining clients still get the frame.
    pub fn broadcast(&mut self, header: &Bytes, frame: &Bytes) -> BroadcastOutcome {
        let now = Utc::now();
        let camera_id = &self.camera_id;
        let mut outcome = BroadcastOutcome::default();

        self.clients.retain_mut(|client| {
            let result = if client.sink.is_closed() {
                Err(SinkError::Closed)
            } else {
                client.sink.write_part(header.clone(), frame.clone())
            };

            match result {
                Ok(()) => {
                    client.last_activity = now;
                    client.frames_sent += 1;
                    outcome.delivered += 1;
                    true
                }
                Err(SinkError::Full) => {
                    client.frames_skipped += 1;
                    outcome.skipped += 1;
                    if client.frames_skipped % 10 == 0 {
                        debug!("Client {} on camera {} is slow, skipped {} frames", client.id, camera_id, client.frames_skipped);
                    }
                    true
                }
                Err(e) => {
                    debug!("Removing disconnected client {} from camera {}: {}", client.id, camera_id, e);
                    client.sink.close();
                    outcome.removed.push(client.id.clone());
                    false
                }
            }
        });

        outcome
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|c| ClientInfo {
                id: c.id.clone(),
                connected_at: c.connected_at,
                last_activity: c.last_activity,
                frames_sent: c.frames_sent,
                frames_skipped: c.frames_skipped,
            })
            .collect()
    }
}
