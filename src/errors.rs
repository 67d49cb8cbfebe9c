use thiserror::Error;

use crate::client_registry::SinkError;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Camera already registered: {camera_id}")]
    AlreadyRegistered { camera_id: String },

    #[error("Camera validation failed: {message}")]
    Validation { message: String },

    #[error("Camera not found: {camera_id}")]
    NotFound { camera_id: String },

    #[error("Client '{client_id}' is already attached to camera '{camera_id}'")]
    DuplicateClient { camera_id: String, client_id: String },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Stream buffer exceeded {limit} bytes without a frame boundary")]
    BufferOverflow { limit: usize },

    #[error("Viewer sink error: {source}")]
    Sink {
        #[from]
        source: SinkError,
    },

    #[error("Camera service is shut down")]
    ShutDown,

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
}

impl CameraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn not_found(camera_id: impl Into<String>) -> Self {
        Self::NotFound { camera_id: camera_id.into() }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream { message: message.into() }
    }

    /// True for errors the caller caused and should not retry.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::AlreadyRegistered { .. } | Self::UrlParse { .. }
        )
    }
}

impl From<reqwest::Error> for CameraError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };
        Self::Upstream { message }
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;
