use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{CameraError, Result};

/// How frames are obtained from the camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One persistent `multipart/x-mixed-replace` response.
    #[default]
    #[serde(rename = "continuous-stream", alias = "mjpeg")]
    ContinuousStream,
    /// Repeated plain GETs, each returning one complete image.
    #[serde(rename = "poll-snapshot", alias = "snapshot")]
    PollSnapshot,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::ContinuousStream => write!(f, "continuous-stream"),
            DeliveryMode::PollSnapshot => write!(f, "poll-snapshot"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub cameras: HashMap<String, CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub cors_allow_origin: Option<String>,
    pub cameras_directory: Option<String>, // JSON/TOML camera files, watched for changes
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allow_origin: Some("*".to_string()),
            cameras_directory: None,
        }
    }
}

/// Limits shared by every camera stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize, // Upstream bytes allowed between two frame boundaries
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize, // Frames queued per viewer before frames are skipped
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64, // Reconnect if the upstream sends nothing for this long
    pub idle_timeout_secs: Option<u64>, // Disconnect upstream after this long without viewers (None = never)
}

fn default_max_buffer_bytes() -> usize { 10 * 1024 * 1024 } // 10MB
fn default_client_queue_capacity() -> usize { 8 }
fn default_stall_timeout_secs() -> u64 { 30 }

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
            client_queue_capacity: default_client_queue_capacity(),
            stall_timeout_secs: default_stall_timeout_secs(),
            idle_timeout_secs: None,
        }
    }
}

impl StreamSettings {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "type")]
    pub mode: DeliveryMode,
    #[serde(default, alias = "streamUrl")]
    pub stream_url: String,
    #[serde(default, alias = "snapshotUrl", skip_serializing_if = "Option::is_none")]
    pub snapshot_url: Option<String>,
    #[serde(default, alias = "adminUrl", skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_attempts", alias = "retryAttempts")]
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>, // Poll cadence for poll-snapshot cameras
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Upper bound for `fps` on poll-snapshot cameras.
pub const MAX_POLL_FPS: u32 = 30;

fn default_timeout_ms() -> u64 { 5000 }
fn default_retry_attempts() -> u32 { 5 }

impl CameraConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mode: DeliveryMode::default(),
            stream_url: stream_url.into(),
            snapshot_url: None,
            admin_url: None,
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            fps: None,
            enabled: None,
        }
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_snapshot_url(mut self, url: impl Into<String>) -> Self {
        self.snapshot_url = Some(url.into());
        self
    }

    pub fn snapshot_url(&self) -> &str {
        self.snapshot_url.as_deref().unwrap_or(&self.stream_url)
    }

    /// The URL the upstream connector reads frames from.
    pub fn upstream_url(&self) -> &str {
        match self.mode {
            DeliveryMode::ContinuousStream => &self.stream_url,
            DeliveryMode::PollSnapshot => self.snapshot_url(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        let fps = self.fps.unwrap_or(1).clamp(1, MAX_POLL_FPS);
        Duration::from_millis(1000 / fps as u64)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match &self.username {
            Some(username) if !username.is_empty() => {
                Some((username.as_str(), self.password.as_deref().unwrap_or("")))
            }
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Copy that is safe to hand out through the API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some("***".to_string());
        }
        copy
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CameraError::config("Missing required field: id"));
        }
        if self.name.trim().is_empty() {
            return Err(CameraError::config(format!("Missing required field 'name' for camera '{}'", self.id)));
        }
        if self.stream_url.trim().is_empty() {
            return Err(CameraError::config(format!("Missing required field 'stream_url' for camera '{}'", self.id)));
        }
        check_http_url(&self.stream_url)?;
        if let Some(url) = &self.snapshot_url {
            check_http_url(url)?;
        }
        if self.timeout_ms == 0 {
            return Err(CameraError::config(format!("Timeout for camera '{}' must be positive", self.id)));
        }
        if self.retry_attempts == 0 {
            return Err(CameraError::config(format!("retry_attempts for camera '{}' must be at least 1", self.id)));
        }
        if let Some(fps) = self.fps {
            if !(1..=MAX_POLL_FPS).contains(&fps) {
                return Err(CameraError::config(format!(
                    "fps for camera '{}' must be between 1 and {}",
                    self.id, MAX_POLL_FPS
                )));
            }
        }
        Ok(())
    }
}

fn check_http_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(CameraError::config(format!("Unsupported URL scheme '{}' in {}", other, raw))),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            stream: StreamSettings::default(),
            cameras: HashMap::new(), // No default cameras - must be configured
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.apply_inline_ids();

        if let Some(cameras_dir) = config.server.cameras_directory.clone() {
            for (camera_id, camera) in Self::load_cameras_from_directory(&cameras_dir)? {
                if config.cameras.contains_key(&camera_id) {
                    warn!("Camera '{}' from '{}' overrides the inline definition", camera_id, cameras_dir);
                }
                config.cameras.insert(camera_id, camera);
            }
        }

        Ok(config)
    }

    /// Inline `[cameras.<id>]` tables are keyed by camera id.
    fn apply_inline_ids(&mut self) {
        for (camera_id, camera) in self.cameras.iter_mut() {
            if camera.id.is_empty() {
                camera.id = camera_id.clone();
            }
        }
    }

    pub fn load_cameras_from_directory(cameras_dir: &str) -> Result<HashMap<String, CameraConfig>> {
        let mut cameras = HashMap::new();

        if !Path::new(cameras_dir).exists() {
            warn!("Cameras directory '{}' does not exist, no cameras will be loaded from it", cameras_dir);
            return Ok(cameras);
        }

        for entry in fs::read_dir(cameras_dir)? {
            let path = entry?.path();
            if camera_id_from_path(&path).is_none() {
                continue;
            }
            match load_camera_file(&path) {
                Ok(camera) => {
                    info!("Loaded camera configuration: {} ({})", camera.id, path.display());
                    cameras.insert(camera.id.clone(), camera);
                }
                Err(e) => {
                    warn!("Skipping camera config file {}: {}", path.display(), e);
                }
            }
        }

        Ok(cameras)
    }
}

/// Camera id for a `<id>.json` / `<id>.toml` file, `None` for anything else.
pub fn camera_id_from_path(path: &Path) -> Option<String> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") | Some("toml") => path.file_stem().and_then(|s| s.to_str()).map(str::to_string),
        _ => None,
    }
}

pub fn load_camera_file(path: &Path) -> Result<CameraConfig> {
    let camera_id = camera_id_from_path(path)
        .ok_or_else(|| CameraError::config(format!("Not a camera config file: {}", path.display())))?;
    let content = fs::read_to_string(path)?;

    let mut camera: CameraConfig = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => toml::from_str(&content)?,
    };
    if camera.id.is_empty() {
        camera.id = camera_id;
    }
    Ok(camera)
}
