//! Typed events published by camera streams and the camera service.
//!
//! Subscribers obtain a receiver from [`crate::CameraService::subscribe`].
//! Delivery is best effort: a receiver that falls behind sees
//! `RecvError::Lagged` and continues with newer events.

use std::time::Duration;

use crate::status::CameraStatus;

/// Lifecycle of one camera stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connecting { attempt: u32 },
    Connected,
    Frame { size: usize, clients: usize },
    Error { message: String },
    Ended,
    ReconnectScheduled { delay: Duration },
    /// The connector stopped retrying; only a new attach restarts it.
    GaveUp { message: String },
    ClientAttached { client_id: String },
    ClientDetached { client_id: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    Added { camera_id: String },
    Removed { camera_id: String },
    Status(CameraStatus),
    Stream { camera_id: String, event: StreamEvent },
}
