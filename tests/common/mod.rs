#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use camera_relay::mjpeg::StreamPreamble;
use camera_relay::upstream::ByteStream;
use camera_relay::{
    CameraConfig, CameraError, CameraEvent, CameraService, CameraSource, CameraState, Result, SinkError, ViewerSink,
};

pub const JPEG_A: &[u8] = b"\xFF\xD8frame-a\xFF\xD9";
pub const JPEG_B: &[u8] = b"\xFF\xD8frame-b\xFF\xD9";
pub const JPEG_C: &[u8] = b"\xFF\xD8frame-c\xFF\xD9";

/// Push side of one simulated upstream connection. Dropping it ends the
/// response body.
pub struct UpstreamFeed(mpsc::UnboundedSender<Result<Bytes>>);

impl UpstreamFeed {
    pub fn send(&self, chunk: impl Into<Bytes>) {
        let _ = self.0.send(Ok(chunk.into()));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.0.send(Err(CameraError::upstream(message)));
    }
}

#[derive(Default)]
struct FakeState {
    reachable: HashSet<String>,
    snapshot: Bytes,
    sessions: VecDeque<mpsc::UnboundedReceiver<Result<Bytes>>>,
}

/// In-memory camera. Probes and fetches succeed for reachable URLs; each
/// `open` consumes one queued session and is refused when none is queued.
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<FakeState>,
    pub opens: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn make_reachable(&self, url: &str) {
        self.state.lock().unwrap().reachable.insert(url.to_string());
    }

    pub fn set_snapshot(&self, image: &'static [u8]) {
        self.state.lock().unwrap().snapshot = Bytes::from_static(image);
    }

    pub fn queue_session(&self) -> UpstreamFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().sessions.push_back(rx);
        UpstreamFeed(tx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraSource for FakeSource {
    async fn open(&self, url: &str, _camera: &CameraConfig) -> Result<ByteStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.state.lock().unwrap().sessions.pop_front() {
            Some(rx) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            None => Err(CameraError::upstream(format!("connection refused: {}", url))),
        }
    }

    async fn fetch(&self, url: &str, _camera: &CameraConfig) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.reachable.contains(url) {
            Ok(state.snapshot.clone())
        } else {
            Err(CameraError::upstream(format!("connection refused: {}", url)))
        }
    }

    async fn probe(&self, camera: &CameraConfig) -> Result<()> {
        if self.state.lock().unwrap().reachable.contains(&camera.stream_url) {
            Ok(())
        } else {
            Err(CameraError::upstream(format!("connection refused: {}", camera.stream_url)))
        }
    }
}

#[derive(Default)]
struct SinkState {
    preamble: Option<StreamPreamble>,
    parts: Vec<(Bytes, Bytes)>,
    closed: bool,
    fail_writes: bool,
}

/// Viewer sink that records what it receives.
#[derive(Clone, Default)]
pub struct RecordingSink(Arc<Mutex<SinkState>>);

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.0.lock().unwrap().fail_writes = true;
        sink
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.0.lock().unwrap().parts.iter().map(|(_, frame)| frame.clone()).collect()
    }

    pub fn headers(&self) -> Vec<Bytes> {
        self.0.lock().unwrap().parts.iter().map(|(header, _)| header.clone()).collect()
    }

    pub fn preamble(&self) -> Option<StreamPreamble> {
        self.0.lock().unwrap().preamble.clone()
    }

    pub fn closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

impl ViewerSink for RecordingSink {
    fn begin(&self, preamble: &StreamPreamble) -> std::result::Result<(), SinkError> {
        self.0.lock().unwrap().preamble = Some(preamble.clone());
        Ok(())
    }

    fn write_part(&self, header: Bytes, frame: Bytes) -> std::result::Result<(), SinkError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_writes {
            return Err(SinkError::Closed);
        }
        state.parts.push((header, frame));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }

    fn close(&self) {
        self.0.lock().unwrap().closed = true;
    }
}

pub fn camera(id: &str) -> CameraConfig {
    CameraConfig::new(id, format!("Camera {}", id), format!("http://{}.local/video.mjpg", id))
}

/// One multipart body carrying `frames`, ending with the boundary that
/// completes the last frame.
pub fn multipart(frames: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    for frame in frames {
        body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(frame);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"--frame\r\n");
    body
}

/// Poll `condition` until it holds, failing after ten (possibly virtual)
/// seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(service: &CameraService, camera_id: &str, state: CameraState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = service.get_status(camera_id).await.expect("camera is registered");
        if status.status == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} to be {}, last status {:?}",
            camera_id,
            state,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Status values published for `camera_id`, in order.
pub fn drain_states(events: &mut broadcast::Receiver<CameraEvent>, camera_id: &str) -> Vec<CameraState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CameraEvent::Status(status) = event {
            if status.id == camera_id {
                states.push(status.status);
            }
        }
    }
    states
}

/// True if `expected` appears in `seen` in order, not necessarily adjacent.
pub fn contains_in_order<T: PartialEq>(seen: &[T], expected: &[T]) -> bool {
    let mut rest = seen.iter();
    expected.iter().all(|wanted| rest.any(|item| item == wanted))
}
