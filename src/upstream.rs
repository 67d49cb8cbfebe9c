use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{debug, trace};

use crate::config::CameraConfig;
use crate::errors::{CameraError, Result};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const USER_AGENT: &str = concat!("camera-relay/", env!("CARGO_PKG_VERSION"));

/// HTTP access to cameras, as seen by the multiplexer.
#[async_trait]
pub trait CameraSource: Send + Sync {
    /// Start a GET to `url` and return its body as a stream once the response
    /// headers arrive. Only the header phase is bounded by the camera timeout.
    async fn open(&self, url: &str, camera: &CameraConfig) -> Result<ByteStream>;

    /// Fetch a complete body, bounded by the camera timeout.
    async fn fetch(&self, url: &str, camera: &CameraConfig) -> Result<Bytes>;

    /// Check that the camera's stream URL answers with a success status.
    async fn probe(&self, camera: &CameraConfig) -> Result<()>;
}

pub struct HttpCameraSource {
    client: reqwest::Client,
}

impl HttpCameraSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CameraError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn get(&self, url: &str, camera: &CameraConfig) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some((username, password)) = camera.credentials() {
            req = req.basic_auth(username, Some(password));
        }
        req
    }

    async fn send_with_timeout(&self, req: reqwest::RequestBuilder, url: &str, camera: &CameraConfig) -> Result<reqwest::Response> {
        let res = match tokio::time::timeout(camera.timeout(), req.send()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CameraError::upstream(format!(
                    "no response from {} within {}ms",
                    url, camera.timeout_ms
                )));
            }
        };
        check_status(res, url)
    }
}

fn check_status(res: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = res.status();
    debug!(target: "camera_upstream", url = %url, status = %status, "Camera response received");
    if !status.is_success() {
        return Err(CameraError::upstream(format!("camera returned HTTP {} for {}", status, url)));
    }
    Ok(res)
}

#[async_trait]
impl CameraSource for HttpCameraSource {
    async fn open(&self, url: &str, camera: &CameraConfig) -> Result<ByteStream> {
        debug!(target: "camera_upstream", camera_id = %camera.id, url = %url, "Opening camera stream");
        let req = self.get(url, camera).header("Accept", "multipart/x-mixed-replace");
        let res = self.send_with_timeout(req, url, camera).await?;
        if let Some(content_type) = res.headers().get(reqwest::header::CONTENT_TYPE) {
            trace!(target: "camera_upstream", camera_id = %camera.id, content_type = ?content_type, "Upstream content type");
        }
        Ok(Box::pin(res.bytes_stream().map(|chunk| chunk.map_err(CameraError::from))))
    }

    async fn fetch(&self, url: &str, camera: &CameraConfig) -> Result<Bytes> {
        let req = self.get(url, camera).timeout(camera.timeout());
        let res = check_status(req.send().await?, url)?;
        let body = res.bytes().await?;
        debug!(target: "camera_upstream", camera_id = %camera.id, size = body.len(), "Snapshot fetched");
        Ok(body)
    }

    async fn probe(&self, camera: &CameraConfig) -> Result<()> {
        debug!("Validating camera: {}", camera.stream_url);
        // Headers are enough; the body (possibly endless) is dropped unread
        let res = self.send_with_timeout(self.get(&camera.stream_url, camera), &camera.stream_url, camera).await?;
        drop(res);
        Ok(())
    }
}
