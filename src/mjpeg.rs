//! Downstream MJPEG delivery.
//!
//! Viewers receive a `multipart/x-mixed-replace` response that stays open for
//! as long as they watch. [`channel_sink`] connects a [`ViewerSink`] held by
//! the client registry to an HTTP body owned by the request handler.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::camera_stream::ViewerHandle;
use crate::client_registry::{SinkError, ViewerSink};

/// Content type and boundary declared once per viewer response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPreamble {
    pub boundary: String,
}

impl StreamPreamble {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self { boundary: boundary.into() }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }
}

/// A boundary token unique to one camera stream.
pub fn new_boundary() -> String {
    format!("camerarelay{}", Uuid::new_v4().simple())
}

/// Header written before every frame delivered to a viewer.
pub fn part_header(boundary: &str, content_length: usize) -> Bytes {
    Bytes::from(format!(
        "\r\n--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        boundary, content_length
    ))
}

pub fn apply_no_cache(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
}

/// Single JPEG response with caching disabled.
pub fn jpeg_response(image: Bytes) -> Response {
    let length = image.len();
    let mut response = Response::new(Body::from(image));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    apply_no_cache(headers);
    response
}

struct Part {
    header: Bytes,
    frame: Bytes,
}

/// Registry side of a viewer connection.
pub struct ChannelSink {
    preamble: Mutex<Option<oneshot::Sender<StreamPreamble>>>,
    parts: Mutex<Option<mpsc::Sender<Part>>>,
}

/// Handler side of a viewer connection.
pub struct SinkReceiver {
    preamble: oneshot::Receiver<StreamPreamble>,
    parts: mpsc::Receiver<Part>,
}

/// Create a sink that queues up to `capacity` frames for one viewer.
pub fn channel_sink(capacity: usize) -> (ChannelSink, SinkReceiver) {
    let (preamble_tx, preamble_rx) = oneshot::channel();
    let (parts_tx, parts_rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink {
            preamble: Mutex::new(Some(preamble_tx)),
            parts: Mutex::new(Some(parts_tx)),
        },
        SinkReceiver {
            preamble: preamble_rx,
            parts: parts_rx,
        },
    )
}

impl ViewerSink for ChannelSink {
    fn begin(&self, preamble: &StreamPreamble) -> Result<(), SinkError> {
        let tx = self
            .preamble
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SinkError::Closed)?;
        tx.send(preamble.clone()).map_err(|_| SinkError::Closed)
    }

    fn write_part(&self, header: Bytes, frame: Bytes) -> Result<(), SinkError> {
        let parts = self.parts.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = parts.as_ref().ok_or(SinkError::Closed)?;
        tx.try_send(Part { header, frame }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn is_closed(&self) -> bool {
        self.parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }

    fn close(&self) {
        // Dropping the senders ends the body once queued parts are flushed
        self.parts.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.preamble.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl SinkReceiver {
    /// Build the streaming response. Dropping the body (viewer went away)
    /// drops `viewer`, which detaches the client.
    pub fn into_response(mut self, viewer: ViewerHandle) -> Response {
        let preamble = match self.preamble.try_recv() {
            Ok(preamble) => preamble,
            Err(_) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "Camera stream did not start").into_response();
            }
        };
        let content_type = match HeaderValue::from_str(&preamble.content_type()) {
            Ok(value) => value,
            Err(_) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid stream boundary").into_response();
            }
        };

        let body = MjpegBody {
            parts: ReceiverStream::new(self.parts),
            pending: None,
            _viewer: viewer,
        };
        let mut response = Response::new(Body::from_stream(body));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, content_type);
        apply_no_cache(headers);
        response
    }
}

struct MjpegBody {
    parts: ReceiverStream<Part>,
    pending: Option<Bytes>,
    _viewer: ViewerHandle,
}

impl Stream for MjpegBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(frame) = self.pending.take() {
            return Poll::Ready(Some(Ok(frame)));
        }
        match self.parts.poll_next_unpin(cx) {
            Poll::Ready(Some(part)) => {
                self.pending = Some(part.frame);
                Poll::Ready(Some(Ok(part.header)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
