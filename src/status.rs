use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::events::CameraEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Online,
    Offline,
    Connecting,
    Error,
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Online => write!(f, "online"),
            CameraState::Offline => write!(f, "offline"),
            CameraState::Connecting => write!(f, "connecting"),
            CameraState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatus {
    pub id: String,
    pub status: CameraState,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub client_count: usize,
}

/// Shared, observable status of one camera.
///
/// Every change is published as [`CameraEvent::Status`]. Readers take a
/// consistent copy with [`StatusHandle::snapshot`].
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<CameraStatus>>,
    events: broadcast::Sender<CameraEvent>,
}

impl StatusHandle {
    pub fn new(camera_id: &str, state: CameraState, events: broadcast::Sender<CameraEvent>) -> Self {
        let status = CameraStatus {
            id: camera_id.to_string(),
            status: state,
            last_seen: (state == CameraState::Online).then(Utc::now),
            error: None,
            client_count: 0,
        };
        Self {
            inner: Arc::new(RwLock::new(status)),
            events,
        }
    }

    pub fn snapshot(&self) -> CameraStatus {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn state(&self) -> CameraState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).status
    }

    /// Move to `state`. The error text is replaced (cleared when `None`);
    /// reaching `Online` refreshes the last-seen time.
    pub fn transition(&self, state: CameraState, error: Option<String>) {
        let updated = {
            let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            status.status = state;
            status.error = error;
            if state == CameraState::Online {
                status.last_seen = Some(Utc::now());
            }
            status.clone()
        };
        let _ = self.events.send(CameraEvent::Status(updated));
    }

    /// Record upstream activity without publishing an event.
    pub fn touch(&self) {
        let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        status.last_seen = Some(Utc::now());
    }

    pub fn set_client_count(&self, count: usize) {
        let updated = {
            let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if status.client_count == count {
                return;
            }
            status.client_count = count;
            status.clone()
        };
        let _ = self.events.send(CameraEvent::Status(updated));
    }
}
