//! Camera stream multiplexing.
//!
//! Each registered camera gets at most one upstream HTTP connection, whose
//! MJPEG (or polled JPEG) frames are fanned out to any number of viewers.

pub mod camera_service;
pub mod camera_stream;
pub mod client_registry;
pub mod config;
pub mod connector;
pub mod demux;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod mjpeg;
pub mod status;
pub mod upstream;
pub mod watcher;

pub use camera_service::CameraService;
pub use camera_stream::{CameraStream, ViewerHandle};
pub use client_registry::{SinkError, ViewerSink};
pub use config::{CameraConfig, Config, DeliveryMode, StreamSettings};
pub use errors::{CameraError, Result};
pub use events::{CameraEvent, StreamEvent};
pub use status::{CameraState, CameraStatus};
pub use upstream::{CameraSource, HttpCameraSource};
