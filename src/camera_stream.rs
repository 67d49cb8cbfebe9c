use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client_registry::{ClientInfo, ClientRegistry, ViewerSink};
use crate::config::{CameraConfig, StreamSettings};
use crate::connector::{ConnectorEvent, ConnectorObserver, ConnectorState, UpstreamConnector};
use crate::errors::{CameraError, Result};
use crate::events::{CameraEvent, StreamEvent};
use crate::mjpeg::{new_boundary, part_header, StreamPreamble};
use crate::status::{CameraState, CameraStatus, StatusHandle};
use crate::upstream::CameraSource;

/// State shared between a camera stream and its connector task.
struct StreamCore {
    camera_id: String,
    preamble: StreamPreamble,
    registry: Mutex<ClientRegistry>,
    status: StatusHandle,
    events: broadcast::Sender<CameraEvent>,
    frames: AtomicU64,
    /// When the last viewer left; `None` while someone is watching.
    empty_since: Mutex<Option<Instant>>,
    /// True while no connector task should be running. Held while an event
    /// is applied, so once set no event from an aborted task lands.
    stopped: Mutex<bool>,
    closed: AtomicBool,
}

impl StreamCore {
    fn publish(&self, event: StreamEvent) {
        let _ = self.events.send(CameraEvent::Stream {
            camera_id: self.camera_id.clone(),
            event,
        });
    }

    /// Must be called with the registry lock held so counts stay in order.
    fn client_count_changed(&self, count: usize) {
        self.status.set_client_count(count);
        let mut empty_since = self.empty_since.lock().unwrap_or_else(PoisonError::into_inner);
        match (count, *empty_since) {
            (0, None) => *empty_since = Some(Instant::now()),
            (0, Some(_)) => {}
            _ => *empty_since = None,
        }
    }

    fn idle_for(&self) -> Option<Duration> {
        self.empty_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|since| since.elapsed())
    }

    fn deliver(&self, frame: Bytes) {
        self.status.touch();
        let header = part_header(&self.preamble.boundary, frame.len());
        let size = frame.len();

        let (outcome, count) = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = registry.broadcast(&header, &frame);
            let count = registry.len();
            if !outcome.removed.is_empty() {
                self.client_count_changed(count);
            }
            (outcome, count)
        };

        let frame_number = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if frame_number % 100 == 0 {
            debug!(
                "Camera {} delivered frame {} ({} bytes) to {} clients",
                self.camera_id, frame_number, size, count
            );
        }

        for client_id in outcome.removed {
            self.publish(StreamEvent::ClientDetached { client_id });
        }
        self.publish(StreamEvent::Frame {
            size,
            clients: outcome.delivered,
        });
    }
}

impl ConnectorObserver for StreamCore {
    fn on_connector_event(&self, event: ConnectorEvent) {
        // A task being aborted may still be finishing its current step
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        if *stopped || self.closed.load(Ordering::Acquire) {
            return;
        }

        let event = match event {
            ConnectorEvent::Frame(frame) => return self.deliver(frame),
            ConnectorEvent::Connecting { attempt } => {
                self.status.transition(CameraState::Connecting, None);
                StreamEvent::Connecting { attempt }
            }
            ConnectorEvent::Connected => {
                self.status.transition(CameraState::Online, None);
                StreamEvent::Connected
            }
            ConnectorEvent::Error { message } => {
                self.status.transition(CameraState::Error, Some(message.clone()));
                StreamEvent::Error { message }
            }
            ConnectorEvent::Ended => {
                self.status
                    .transition(CameraState::Error, Some("upstream stream ended".to_string()));
                StreamEvent::Ended
            }
            ConnectorEvent::ReconnectScheduled { delay } => StreamEvent::ReconnectScheduled { delay },
            ConnectorEvent::GaveUp { message } => {
                self.status.transition(CameraState::Offline, Some(message.clone()));
                StreamEvent::GaveUp { message }
            }
        };
        self.publish(event);
    }
}

/// One upstream connection to a camera, shared by all of its viewers.
///
/// The connector task is started on demand and restarted by the next attach
/// after it gives up. Dropping the stream stops the task.
pub struct CameraStream {
    core: Arc<StreamCore>,
    connector: Arc<UpstreamConnector>,
    task: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    idle_timeout: Option<Duration>,
}

impl CameraStream {
    pub fn new(
        camera: Arc<CameraConfig>,
        source: Arc<dyn CameraSource>,
        settings: &StreamSettings,
        status: StatusHandle,
        events: broadcast::Sender<CameraEvent>,
    ) -> Arc<Self> {
        let camera_id = camera.id.clone();
        info!("Creating camera stream for '{}' ({} mode)", camera_id, camera.mode);

        let core = Arc::new(StreamCore {
            preamble: StreamPreamble::new(new_boundary()),
            registry: Mutex::new(ClientRegistry::new(camera_id.clone())),
            camera_id,
            status,
            events,
            frames: AtomicU64::new(0),
            empty_since: Mutex::new(Some(Instant::now())),
            stopped: Mutex::new(true),
            closed: AtomicBool::new(false),
        });
        let connector = Arc::new(UpstreamConnector::new(camera, source, settings.clone(), core.clone()));

        Arc::new(Self {
            core,
            connector,
            task: Mutex::new(None),
            watchdog: Mutex::new(None),
            idle_timeout: settings.idle_timeout(),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.core.camera_id
    }

    pub fn preamble(&self) -> &StreamPreamble {
        &self.core.preamble
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn connector_state(&self) -> ConnectorState {
        self.connector.state()
    }

    pub fn status(&self) -> CameraStatus {
        self.core.status.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.core.registry.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.core.registry.lock().unwrap_or_else(PoisonError::into_inner).clients()
    }

    /// Start the connector unless it is already running.
    pub fn start(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }

        {
            let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                return;
            }
            *self.core.stopped.lock().unwrap_or_else(PoisonError::into_inner) = false;
            let connector = self.connector.clone();
            *task = Some(tokio::spawn(async move {
                connector.run().await;
            }));
        }

        if let Some(idle_timeout) = self.idle_timeout {
            let mut watchdog = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner);
            if watchdog.is_none() {
                *watchdog = Some(tokio::spawn(idle_watchdog(Arc::downgrade(self), idle_timeout)));
            }
        }
    }

    /// Abort the connector task, leaving viewers attached. Status goes
    /// `offline` and stays there until the next start.
    fn stop_connector(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut stopped = self.core.stopped.lock().unwrap_or_else(PoisonError::into_inner);
            *stopped = true;
            self.core.status.transition(CameraState::Offline, None);
        }
        if let Some(task) = task.take() {
            task.abort();
        }
        self.connector.mark_disconnected();
    }

    /// Attach a viewer. It receives the preamble now and every frame that
    /// arrives after this call returns.
    pub fn attach(self: &Arc<Self>, client_id: String, sink: Box<dyn ViewerSink>) -> Result<ViewerHandle> {
        if self.is_closed() {
            sink.close();
            return Err(CameraError::not_found(self.camera_id()));
        }

        {
            let mut registry = self.core.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.attach(client_id.clone(), sink, &self.core.preamble)?;
            self.core.client_count_changed(registry.len());
        }
        self.core.publish(StreamEvent::ClientAttached {
            client_id: client_id.clone(),
        });

        self.start();

        Ok(ViewerHandle {
            stream: Arc::downgrade(self),
            client_id,
            detached: false,
        })
    }

    /// Detach a viewer. Returns false if it was not attached.
    pub fn detach(&self, client_id: &str) -> bool {
        let removed = {
            let mut registry = self.core.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = registry.detach(client_id);
            if removed {
                self.core.client_count_changed(registry.len());
            }
            removed
        };
        if removed {
            self.core.publish(StreamEvent::ClientDetached {
                client_id: client_id.to_string(),
            });
        }
        removed
    }

    /// Stop the connection for good and end every viewer's response.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing camera stream for '{}'", self.core.camera_id);

        if let Some(watchdog) = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner).take() {
            watchdog.abort();
        }
        self.stop_connector();

        let detached = {
            let mut registry = self.core.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let detached = registry.clear();
            self.core.client_count_changed(0);
            detached
        };

        for client_id in detached {
            self.core.publish(StreamEvent::ClientDetached { client_id });
        }
        self.core.publish(StreamEvent::Closed);
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.close();
    }
}

async fn idle_watchdog(stream: Weak<CameraStream>, idle_timeout: Duration) {
    let check_every = idle_timeout.min(Duration::from_secs(1));
    loop {
        tokio::time::sleep(check_every).await;
        let Some(stream) = stream.upgrade() else {
            return;
        };
        if stream.is_closed() {
            return;
        }
        if stream.is_running() && stream.core.idle_for().is_some_and(|idle| idle >= idle_timeout) {
            warn!(
                "Camera {} has had no viewers for {}s, disconnecting upstream",
                stream.camera_id(),
                idle_timeout.as_secs()
            );
            stream.stop_connector();
        }
    }
}

/// Attachment of one viewer. Dropping it detaches the viewer.
#[must_use = "dropping the handle detaches the viewer"]
pub struct ViewerHandle {
    stream: Weak<CameraStream>,
    client_id: String,
    detached: bool,
}

impl ViewerHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn detach(mut self) -> bool {
        self.detach_inner()
    }

    fn detach_inner(&mut self) -> bool {
        if std::mem::replace(&mut self.detached, true) {
            return false;
        }
        match self.stream.upgrade() {
            Some(stream) => stream.detach(&self.client_id),
            None => false,
        }
    }
}

impl Drop for ViewerHandle {
    fn drop(&mut self) {
        self.detach_inner();
    }
}

impl std::fmt::Debug for ViewerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerHandle")
            .field("client_id", &self.client_id)
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mjpeg::channel_sink;
    use crate::upstream::ByteStream;
    use async_trait::async_trait;

    /// A camera that never answers.
    struct SilentSource;

    #[async_trait]
    impl CameraSource for SilentSource {
        async fn open(&self, _url: &str, _camera: &CameraConfig) -> Result<ByteStream> {
            std::future::pending().await
        }

        async fn fetch(&self, _url: &str, _camera: &CameraConfig) -> Result<Bytes> {
            std::future::pending().await
        }

        async fn probe(&self, _camera: &CameraConfig) -> Result<()> {
            Ok(())
        }
    }

    fn stream() -> (Arc<CameraStream>, broadcast::Receiver<CameraEvent>) {
        let (events, rx) = broadcast::channel(64);
        let camera = Arc::new(CameraConfig::new("cam", "Cam", "http://camera.local/video"));
        let status = StatusHandle::new("cam", CameraState::Online, events.clone());
        let stream = CameraStream::new(camera, Arc::new(SilentSource), &StreamSettings::default(), status, events);
        (stream, rx)
    }

    #[tokio::test]
    async fn test_dropping_handle_detaches_viewer() {
        let (stream, _rx) = stream();
        let (sink, _receiver) = channel_sink(4);

        let handle = stream.attach("viewer".into(), Box::new(sink)).unwrap();
        assert_eq!(handle.client_id(), "viewer");
        assert_eq!(stream.client_count(), 1);
        assert_eq!(stream.status().client_count, 1);
        assert!(stream.is_running());

        drop(handle);
        assert_eq!(stream.client_count(), 0);
        assert_eq!(stream.status().client_count, 0);
    }

    #[tokio::test]
    async fn test_explicit_detach_then_drop_is_harmless() {
        let (stream, _rx) = stream();
        let (sink, _receiver) = channel_sink(4);
        let handle = stream.attach("viewer".into(), Box::new(sink)).unwrap();

        assert!(stream.detach("viewer"));
        assert!(!handle.detach());
        assert!(!stream.detach("viewer"));
    }

    #[tokio::test]
    async fn test_close_ends_viewers_and_refuses_attach() {
        let (stream, mut rx) = stream();
        let (sink, _receiver) = channel_sink(4);
        let _handle = stream.attach("viewer".into(), Box::new(sink)).unwrap();

        stream.close();
        assert!(!stream.is_running());
        assert_eq!(stream.connector_state(), ConnectorState::Disconnected);
        assert_eq!(stream.client_count(), 0);
        assert_eq!(stream.status().status, CameraState::Offline);

        let (late, _late_rx) = channel_sink(4);
        assert!(matches!(
            stream.attach("late".into(), Box::new(late)),
            Err(CameraError::NotFound { .. })
        ));

        let mut saw_closed = false;
        while let Ok(event) = rx.try_recv() {
            if let CameraEvent::Stream { event: StreamEvent::Closed, .. } = event {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn test_events_after_stop_are_ignored() {
        let (stream, _rx) = stream();
        let (sink, _receiver) = channel_sink(4);
        let _handle = stream.attach("viewer".into(), Box::new(sink)).unwrap();

        stream.stop_connector();
        assert_eq!(stream.status().status, CameraState::Offline);

        // Late events from the aborted task
        stream.core.on_connector_event(ConnectorEvent::Connected);
        stream.core.on_connector_event(ConnectorEvent::Frame(Bytes::from_static(b"late")));
        assert_eq!(stream.status().status, CameraState::Offline);
        assert_eq!(stream.core.frames.load(Ordering::Relaxed), 0);

        stream.start();
        stream.core.on_connector_event(ConnectorEvent::Connected);
        assert_eq!(stream.status().status, CameraState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watchdog_stops_connector() {
        let (events, _rx) = broadcast::channel(64);
        let camera = Arc::new(CameraConfig::new("cam", "Cam", "http://camera.local/video"));
        let status = StatusHandle::new("cam", CameraState::Online, events.clone());
        let settings = StreamSettings {
            idle_timeout_secs: Some(5),
            ..StreamSettings::default()
        };
        let stream = CameraStream::new(camera, Arc::new(SilentSource), &settings, status, events);

        let (sink, _receiver) = channel_sink(4);
        let handle = stream.attach("viewer".into(), Box::new(sink)).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(stream.is_running());

        drop(handle);
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(!stream.is_running());
        assert_eq!(stream.status().status, CameraState::Offline);

        let (sink, _receiver) = channel_sink(4);
        let _handle = stream.attach("again".into(), Box::new(sink)).unwrap();
        assert!(stream.is_running());
    }
}
