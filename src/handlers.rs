use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::camera_service::CameraService;
use crate::config::CameraConfig;
use crate::errors::CameraError;
use crate::mjpeg::{channel_sink, jpeg_response};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    status: &'static str,
    timestamp: DateTime<Utc>,
    uptime_secs: u64,
    version: &'static str,
    cameras: usize,
}

pub fn error_status(err: &CameraError) -> StatusCode {
    match err {
        CameraError::NotFound { .. } => StatusCode::NOT_FOUND,
        CameraError::AlreadyRegistered { .. } | CameraError::DuplicateClient { .. } => StatusCode::CONFLICT,
        CameraError::Config { .. }
        | CameraError::UrlParse { .. }
        | CameraError::Json { .. }
        | CameraError::Toml { .. } => StatusCode::BAD_REQUEST,
        CameraError::Validation { .. } | CameraError::Upstream { .. } | CameraError::BufferOverflow { .. } => {
            StatusCode::BAD_GATEWAY
        }
        CameraError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        CameraError::Sink { .. } | CameraError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &CameraError) -> Response {
    let status = error_status(err);
    (status, Json(ApiResponse::<()>::error(&err.to_string(), status.as_u16()))).into_response()
}

pub fn cors_layer(allow_origin: Option<&str>) -> CorsLayer {
    match allow_origin {
        Some("*") | None => CorsLayer::permissive(),
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin_header) => CorsLayer::new()
                .allow_origin(origin_header)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                CorsLayer::permissive()
            }
        },
    }
}

pub fn router(service: Arc<CameraService>, cors_allow_origin: Option<&str>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/camera", post(register_camera_handler))
        .route("/api/camera/status", get(list_statuses_handler))
        .route("/api/camera/list", get(list_cameras_handler))
        .route("/api/camera/:id", delete(remove_camera_handler))
        .route("/api/camera/:id/status", get(camera_status_handler))
        .route("/api/camera/:id/snapshot", get(snapshot_handler))
        .route("/api/camera/:id/stream", get(stream_handler))
        .layer(cors_layer(cors_allow_origin))
        .with_state(service)
}

async fn health_handler(State(service): State<Arc<CameraService>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "OK",
        timestamp: Utc::now(),
        uptime_secs: service.uptime().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        cameras: service.camera_count().await,
    })
}

async fn list_statuses_handler(State(service): State<Arc<CameraService>>) -> Response {
    Json(ApiResponse::success(service.list_statuses().await)).into_response()
}

async fn list_cameras_handler(State(service): State<Arc<CameraService>>) -> Response {
    Json(ApiResponse::success(service.list_cameras().await)).into_response()
}

async fn camera_status_handler(
    State(service): State<Arc<CameraService>>,
    Path(camera_id): Path<String>,
) -> Response {
    match service.get_status(&camera_id).await {
        Some(status) => Json(ApiResponse::success(status)).into_response(),
        None => error_response(&CameraError::not_found(camera_id)),
    }
}

async fn register_camera_handler(
    State(service): State<Arc<CameraService>>,
    body: Result<Json<CameraConfig>, JsonRejection>,
) -> Response {
    let config = match body {
        Ok(Json(config)) => config,
        Err(rejection) => {
            warn!("Rejected camera registration body: {}", rejection.body_text());
            return error_response(&CameraError::config(rejection.body_text()));
        }
    };
    let camera_id = config.id.clone();
    info!("API request to register camera '{}'", camera_id);
    match service.register_camera(config).await {
        Ok(()) => {
            let status = service.get_status(&camera_id).await;
            (StatusCode::CREATED, Json(ApiResponse::success(status))).into_response()
        }
        Err(e) => {
            warn!("Camera registration failed for '{}': {}", camera_id, e);
            error_response(&e)
        }
    }
}

async fn remove_camera_handler(
    State(service): State<Arc<CameraService>>,
    Path(camera_id): Path<String>,
) -> Response {
    if service.remove_camera(&camera_id).await {
        Json(ApiResponse::success(format!("Camera '{}' removed", camera_id))).into_response()
    } else {
        error_response(&CameraError::not_found(camera_id))
    }
}

async fn snapshot_handler(
    State(service): State<Arc<CameraService>>,
    Path(camera_id): Path<String>,
) -> Response {
    trace!("Snapshot requested for camera '{}'", camera_id);
    match service.get_snapshot(&camera_id).await {
        Ok(image) => jpeg_response(image),
        Err(e) => error_response(&e),
    }
}

async fn stream_handler(
    State(service): State<Arc<CameraService>>,
    Path(camera_id): Path<String>,
) -> Response {
    let client_id = Uuid::new_v4().to_string();
    let (sink, receiver) = channel_sink(service.settings().client_queue_capacity);

    match service.attach_viewer(&camera_id, client_id.clone(), Box::new(sink)).await {
        Ok(viewer) => {
            info!("Streaming camera '{}' to client {}", camera_id, client_id);
            receiver.into_response(viewer)
        }
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_status(&CameraError::not_found("cam")), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&CameraError::config("missing id")), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&CameraError::validation("refused")), StatusCode::BAD_GATEWAY);
        assert_eq!(
            error_status(&CameraError::AlreadyRegistered { camera_id: "cam".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(error_status(&CameraError::ShutDown), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_api_response_shape() {
        let ok = serde_json::to_value(ApiResponse::success(vec!["cam1"])).unwrap();
        assert_eq!(ok, serde_json::json!({ "status": "success", "data": ["cam1"] }));

        let err = serde_json::to_value(ApiResponse::<()>::error("Camera not found: x", 404)).unwrap();
        assert_eq!(
            err,
            serde_json::json!({ "status": "error", "error": "Camera not found: x", "code": 404 })
        );
    }
}
