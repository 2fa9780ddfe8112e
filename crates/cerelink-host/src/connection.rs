//! Session lifecycle.
//!
//! A [`Connection`] owns every moving part of one device session: the
//! serial link, the reader thread feeding the [`crate::dispatch`] queue,
//! the [`crate::transport`] command path, the watchdog, and (while
//! streaming) the streaming controller with its therapy monitor. External
//! subscribers observe the session through a broadcast event bus; emission
//! never blocks on a subscriber.
//!
//! Lifecycle: `Closed → Opening → Connected ⇄ Disconnected → Closed`.
//! The Disconnected leg is driven by the watchdog and the reconnect loop,
//! which rebuild the port and reader while the dispatcher, registered
//! listeners, and streaming controller stay alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cerelink_core::error::FrameError;
use cerelink_core::protocol::{DeviceError, Framer, FramerEvent, OpCode, Packet};
use cerelink_core::types::{ConnectionStatus, StreamingStatus};

use crate::config::LinkConfig;
use crate::dispatch::Dispatcher;
use crate::events::DeviceEvent;
use crate::link::{default_factory, LinkFactory, SerialLink};
use crate::reconnect;
use crate::streaming::StreamingController;
use crate::transport::Transport;
use crate::watchdog::Watchdog;

/// Capacity of the broadcast event bus. Samples arrive at a few hundred
/// hertz; a slow subscriber lags rather than stalling the link.
const EVENT_BUS_CAPACITY: usize = 1024;

// ============================================================================
// Statistics
// ============================================================================

/// Live session counters, updated by the reader loop and transport.
#[derive(Debug, Default)]
pub struct SessionStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    frame_errors: AtomicU64,
    checksum_errors: AtomicU64,
}

impl SessionStats {
    pub(crate) fn note_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_frame_error(&self, error: &FrameError) {
        if matches!(error, FrameError::ChecksumMismatch { .. }) {
            self.checksum_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frame_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the counters out.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames decoded and queued for dispatch.
    pub packets_received: u64,
    /// Command frames written to the port.
    pub packets_sent: u64,
    /// Framing errors other than checksum mismatches.
    pub frame_errors: u64,
    /// Frames dropped for a bad checksum.
    pub checksum_errors: u64,
}

// ============================================================================
// Shared session state
// ============================================================================

struct ReaderHandle {
    cancel: CancellationToken,
    thread: std::thread::JoinHandle<()>,
}

/// State shared between the session owner and its background tasks
/// (watchdog, reconnect loop, streaming controller, therapy workers).
pub(crate) struct SessionInner {
    pub(crate) config: LinkConfig,
    pub(crate) port_name: String,
    pub(crate) link_factory: LinkFactory,
    pub(crate) events: broadcast::Sender<DeviceEvent>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) transport: Arc<Transport>,
    pub(crate) stats: Arc<SessionStats>,
    pub(crate) cancel: CancellationToken,
    status: Mutex<ConnectionStatus>,
    reader: Mutex<Option<ReaderHandle>>,
}

impl SessionInner {
    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new status and broadcast it.
    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        let _ = self.events.send(DeviceEvent::Status(status));
    }

    /// Start a reader thread pumping bytes from `link` into the dispatch
    /// queue. Any previous reader must have been stopped first.
    pub(crate) fn spawn_reader(&self, link: Box<dyn SerialLink>) {
        let cancel = self.cancel.child_token();
        let queue = self.dispatcher.sender();
        let stats = Arc::clone(&self.stats);
        let thread_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("cerelink-reader".into())
            .spawn(move || reader_loop(link, &queue, &thread_cancel, &stats))
            .expect("spawning the reader thread cannot fail");
        let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(slot.is_none(), "previous reader still running");
        *slot = Some(ReaderHandle { cancel, thread });
    }

    /// Stop the reader thread, waiting up to the configured join bound.
    pub(crate) async fn stop_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            join_thread_bounded(
                handle.thread,
                self.config.shutdown_join_timeout,
                "cerelink-reader",
            )
            .await;
        }
    }
}

/// Wait for `duration`, returning `false` early if `cancel` fires.
pub(crate) async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// Join a worker thread with a deadline; a thread that does not finish in
/// time is logged and detached.
pub(crate) async fn join_thread_bounded(
    handle: std::thread::JoinHandle<()>,
    timeout: Duration,
    name: &str,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if tokio::time::Instant::now() >= deadline {
            warn!(thread = name, "worker did not stop in time; detaching");
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let _ = handle.join();
}

// ============================================================================
// Reader loop
// ============================================================================

/// Byte pump: reads one byte at a time, feeds the framer, and queues
/// decoded frames for dispatch. Runs on a dedicated thread because serial
/// reads block.
fn reader_loop(
    mut link: Box<dyn SerialLink>,
    queue: &tokio::sync::mpsc::Sender<Packet>,
    cancel: &CancellationToken,
    stats: &SessionStats,
) {
    let mut framer = Framer::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match link.read_byte() {
            Ok(Some(byte)) => match framer.push(byte) {
                Some(FramerEvent::Frame(packet)) => {
                    stats.note_packet_received();
                    if queue.blocking_send(packet).is_err() {
                        // Dispatcher is gone; nothing left to feed.
                        break;
                    }
                }
                Some(FramerEvent::Error(error)) => {
                    stats.note_frame_error(&error);
                    warn!(%error, "framing error");
                }
                None => {}
            },
            Ok(None) => {
                // Soft timeout: mid-frame it is worth a note, between
                // frames the line is just idle.
                if framer.mid_frame() {
                    debug!("read timed out inside a frame: incomplete packet");
                }
            }
            Err(error) => {
                warn!(%error, "serial read failed; reader exiting");
                break;
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One device session.
///
/// See the [module docs](self) for the lifecycle. All methods are safe to
/// call in any state; operations that need a live link report their
/// outcome through the returned status instead of panicking.
pub struct Connection {
    config: LinkConfig,
    events: broadcast::Sender<DeviceEvent>,
    link_factory: LinkFactory,
    inner: Option<Arc<SessionInner>>,
    watchdog: Option<Watchdog>,
    streaming: Option<StreamingController>,
    therapy_enabled: bool,
    ever_opened: bool,
}

impl Connection {
    /// Create a session that opens real serial ports.
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        Self::with_link_factory(config, default_factory())
    }

    /// Create a session with a custom link constructor (simulated device,
    /// test mocks).
    #[must_use]
    pub fn with_link_factory(config: LinkConfig, link_factory: LinkFactory) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            config,
            events,
            link_factory,
            inner: None,
            watchdog: None,
            streaming: None,
            therapy_enabled: false,
            ever_opened: false,
        }
    }

    /// Subscribe to the session event bus.
    ///
    /// May be called before `open`; a subscriber that falls behind loses
    /// the oldest events rather than stalling the driver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        match &self.inner {
            Some(inner) => inner.status(),
            None if self.ever_opened => ConnectionStatus::Closed,
            None => ConnectionStatus::Unopened,
        }
    }

    /// Session counters, all zero before the first `open`.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner
            .as_ref()
            .map(|inner| inner.stats.snapshot())
            .unwrap_or_default()
    }

    /// Open the port and perform the session handshake.
    ///
    /// On success the watchdog starts and the session is `Connected`. On
    /// failure everything constructed along the way is torn down again and
    /// the returned status says why.
    pub async fn open(&mut self, port_name: &str) -> ConnectionStatus {
        if self.inner.is_some() {
            return ConnectionStatus::AlreadyConnected;
        }
        self.ever_opened = true;

        let link = match (self.link_factory)(port_name, &self.config) {
            Ok(link) => link,
            Err(error) => {
                warn!(%error, port = port_name, "could not open serial port");
                let _ = self.events.send(DeviceEvent::Status(ConnectionStatus::NoDevice));
                return ConnectionStatus::NoDevice;
            }
        };
        let writer = match link.try_clone() {
            Ok(writer) => writer,
            Err(error) => {
                warn!(%error, port = port_name, "could not clone port writer");
                let _ = self.events.send(DeviceEvent::Status(ConnectionStatus::NoDevice));
                return ConnectionStatus::NoDevice;
            }
        };

        let dispatcher = Dispatcher::start(self.config.queue_capacity);
        let stats = Arc::new(SessionStats::default());
        let transport = Arc::new(Transport::new(
            Arc::clone(&dispatcher),
            self.config.write_timeout,
            Arc::clone(&stats),
        ));
        transport.set_writer(writer).await;

        let inner = Arc::new(SessionInner {
            config: self.config.clone(),
            port_name: port_name.to_string(),
            link_factory: Arc::clone(&self.link_factory),
            events: self.events.clone(),
            dispatcher,
            transport,
            stats,
            cancel: CancellationToken::new(),
            status: Mutex::new(ConnectionStatus::Unopened),
            reader: Mutex::new(None),
        });
        inner.spawn_reader(link);

        match reconnect::handshake(&inner, &inner.cancel).await {
            Ok(()) => {
                info!(port = port_name, "session established");
                inner.set_status(ConnectionStatus::Connected);
                self.watchdog = Some(Watchdog::spawn(Arc::clone(&inner)));
                self.inner = Some(inner);
                ConnectionStatus::Connected
            }
            Err(error) => {
                warn!(%error, port = port_name, "handshake failed");
                inner.cancel.cancel();
                inner.stop_reader().await;
                inner
                    .dispatcher
                    .shutdown(self.config.shutdown_join_timeout)
                    .await;
                inner.transport.clear_writer().await;
                let _ = self.events.send(DeviceEvent::Status(ConnectionStatus::Failed));
                ConnectionStatus::Failed
            }
        }
    }

    /// Activate sample streaming.
    ///
    /// Idempotent: a second call while streaming reports
    /// `AlreadyStreaming`. The streaming controller, and the therapy
    /// monitor inside it, live until [`Connection::stop_streaming`] or
    /// [`Connection::close`], across any number of reconnects.
    pub async fn start_streaming(&mut self) -> StreamingStatus {
        let Some(inner) = self.inner.as_ref() else {
            return StreamingStatus::ConnectionNotOpen;
        };
        if inner.status() != ConnectionStatus::Connected {
            return StreamingStatus::ConnectionNotOpen;
        }
        if self.streaming.is_some() {
            return StreamingStatus::AlreadyStreaming;
        }

        let controller =
            StreamingController::start(Arc::clone(inner), self.therapy_enabled).await;
        self.streaming = Some(controller);
        StreamingStatus::Streaming
    }

    /// Deactivate streaming. Safe to call when not streaming.
    ///
    /// The therapy monitor is destroyed before the stream is shut down at
    /// the device.
    pub async fn stop_streaming(&mut self) {
        if let Some(controller) = self.streaming.take() {
            controller.shutdown().await;
        }
    }

    /// Operator switch for therapy delivery.
    ///
    /// While disabled, seizure detection still runs but no `StartTherapy`
    /// command is issued; disabling while therapy is active stops it.
    pub fn set_therapy_enabled(&mut self, enabled: bool) {
        self.therapy_enabled = enabled;
        if let Some(streaming) = &self.streaming {
            streaming.set_therapy_enabled(enabled);
        } else {
            let _ = self.events.send(DeviceEvent::TherapyEnabled(enabled));
        }
    }

    /// Send a raw command over the session transport.
    ///
    /// # Errors
    ///
    /// `NotConnected` when the session is not open; otherwise whatever the
    /// transport reports.
    pub async fn send_command(&self, opcode: OpCode, data: &[u8]) -> Result<(), DeviceError> {
        match &self.inner {
            Some(inner) => inner.transport.send_command(opcode, data).await,
            None => Err(DeviceError::NotConnected),
        }
    }

    /// Close the session: stop streaming, stop the watchdog, stop
    /// dispatch, stop the reader, release the port. Idempotent.
    pub async fn close(&mut self) {
        self.stop_streaming().await;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.shutdown(self.config.shutdown_join_timeout).await;
        }
        if let Some(inner) = self.inner.take() {
            inner.cancel.cancel();
            inner
                .dispatcher
                .shutdown(self.config.shutdown_join_timeout)
                .await;
            inner.stop_reader().await;
            inner.transport.clear_writer().await;
            inner.set_status(ConnectionStatus::Closed);
            info!("session closed");
        }
    }
}

// ============================================================================
// Test support
// ============================================================================

/// Build a connected-looking [`SessionInner`] around a raw link, with the
/// reader thread running. For module tests that exercise one component
/// against a scripted device.
#[cfg(test)]
pub(crate) async fn test_session_inner(
    config: LinkConfig,
    link: Box<dyn SerialLink>,
) -> Arc<SessionInner> {
    test_session_inner_with_factory(
        config,
        link,
        Arc::new(|_, _| Err(crate::link::LinkError::Closed)),
    )
    .await
}

/// [`test_session_inner`] with a reconnect factory under test control.
#[cfg(test)]
pub(crate) async fn test_session_inner_with_factory(
    config: LinkConfig,
    link: Box<dyn SerialLink>,
    link_factory: LinkFactory,
) -> Arc<SessionInner> {
    let writer = link.try_clone().expect("test link clones");
    let dispatcher = Dispatcher::start(config.queue_capacity);
    let stats = Arc::new(SessionStats::default());
    let transport = Arc::new(Transport::new(
        Arc::clone(&dispatcher),
        config.write_timeout,
        Arc::clone(&stats),
    ));
    transport.set_writer(writer).await;

    let inner = Arc::new(SessionInner {
        config,
        port_name: "test".to_string(),
        link_factory,
        events: broadcast::channel(EVENT_BUS_CAPACITY).0,
        dispatcher,
        transport,
        stats,
        cancel: CancellationToken::new(),
        status: Mutex::new(ConnectionStatus::Connected),
        reader: Mutex::new(None),
    });
    inner.spawn_reader(link);
    inner
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::simulated::SimulatedDevice;

    fn test_config(dir: &std::path::Path) -> LinkConfig {
        LinkConfig {
            write_timeout: Duration::from_millis(200),
            feeding_interval: Duration::from_millis(200),
            stream_retry_delay: Duration::from_millis(50),
            bad_port_retry_delay: Duration::from_millis(50),
            therapy_retry_delay: Duration::from_millis(10),
            stream_log_path: dir.join("stream.csv"),
            ..LinkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_handshake_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            Connection::with_link_factory(test_config(dir.path()), SimulatedDevice::factory());
        assert_eq!(session.status(), ConnectionStatus::Unopened);

        assert_eq!(session.open("sim0").await, ConnectionStatus::Connected);
        assert_eq!(session.status(), ConnectionStatus::Connected);

        // A live session answers pings.
        assert_eq!(session.send_command(OpCode::WatchdogReset, &[]).await, Ok(()));
        assert!(session.stats().packets_sent >= 1);

        session.close().await;
        assert_eq!(session.status(), ConnectionStatus::Closed);
        assert_eq!(
            session.send_command(OpCode::WatchdogReset, &[]).await,
            Err(DeviceError::NotConnected)
        );

        // Idempotent.
        session.close().await;
        assert_eq!(session.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_open_reports_no_device() {
        let dir = tempfile::tempdir().unwrap();
        let factory: LinkFactory =
            Arc::new(|_name, _config| Err(crate::link::LinkError::Closed));
        let mut session = Connection::with_link_factory(test_config(dir.path()), factory);

        assert_eq!(session.open("nope").await, ConnectionStatus::NoDevice);
        assert_eq!(session.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_open_twice_reports_already_connected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            Connection::with_link_factory(test_config(dir.path()), SimulatedDevice::factory());
        assert_eq!(session.open("sim0").await, ConnectionStatus::Connected);
        assert_eq!(session.open("sim0").await, ConnectionStatus::AlreadyConnected);
        session.close().await;
    }

    #[tokio::test]
    async fn test_streaming_delivers_samples_on_event_bus() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            Connection::with_link_factory(test_config(dir.path()), SimulatedDevice::factory());
        let mut events = session.subscribe();

        assert_eq!(session.open("sim0").await, ConnectionStatus::Connected);
        assert_eq!(session.start_streaming().await, StreamingStatus::Streaming);
        assert_eq!(
            session.start_streaming().await,
            StreamingStatus::AlreadyStreaming
        );

        let mut samples = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while samples < 10 && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
                Ok(Ok(DeviceEvent::Sample(_))) => samples += 1,
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                _ => break,
            }
        }
        assert!(samples >= 10, "expected streamed samples, got {samples}");

        session.stop_streaming().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_watchdog_recovery_reactivates_streaming() {
        use cerelink_core::protocol::PacketType;

        use crate::link::mock::{MockHandle, MockLink};

        let dir = tempfile::tempdir().unwrap();
        let config = LinkConfig {
            write_timeout: Duration::from_millis(50),
            feeding_interval: Duration::from_millis(100),
            watchdog_attempts: 2,
            connection_attempts: 2,
            bad_port_retry_delay: Duration::from_millis(20),
            stream_retry_delay: Duration::from_millis(20),
            stream_log_path: dir.path().join("stream.csv"),
            ..LinkConfig::default()
        };

        // Every link the factory hands out acknowledges all commands
        // until the test silences it.
        let handles: Arc<Mutex<Vec<MockHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let handles_clone = Arc::clone(&handles);
        let factory: LinkFactory = Arc::new(move |_name, _config| {
            let (link, handle) = MockLink::new();
            handle.respond_with(|packet: &Packet| {
                vec![Packet {
                    packet_type: PacketType::Command,
                    id: packet.id,
                    payload: vec![0x00],
                }]
            });
            handles_clone.lock().unwrap().push(handle);
            Ok(Box::new(link) as Box<dyn SerialLink>)
        });

        let mut session = Connection::with_link_factory(config, factory);
        let mut events = session.subscribe();

        assert_eq!(session.open("mock0").await, ConnectionStatus::Connected);
        assert_eq!(session.start_streaming().await, StreamingStatus::Streaming);

        // The device goes silent: every ping now times out.
        handles.lock().unwrap()[0].respond_with(|_packet: &Packet| Vec::new());

        // The watchdog must notice, announce the outage, and reconnect.
        let mut saw_disconnected = false;
        let mut saw_reconnected = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !saw_reconnected && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
                Ok(Ok(DeviceEvent::Status(ConnectionStatus::Disconnected))) => {
                    saw_disconnected = true;
                }
                Ok(Ok(DeviceEvent::Status(ConnectionStatus::Connected))) if saw_disconnected => {
                    saw_reconnected = true;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                _ => {}
            }
        }
        assert!(saw_disconnected, "watchdog never reported the outage");
        assert!(saw_reconnected, "session never recovered");

        // The replacement link must see the handshake and then a fresh
        // stream activation.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut reactivated = false;
        while !reactivated && tokio::time::Instant::now() < deadline {
            {
                let handles = handles.lock().unwrap();
                if handles.len() >= 2 {
                    let written = handles[handles.len() - 1].written();
                    reactivated = written
                        .iter()
                        .any(|p| p.payload.first() == Some(&(OpCode::StartStreaming as u8)));
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reactivated, "stream was not re-activated after reconnect");

        session.close().await;
    }

    #[tokio::test]
    async fn test_streaming_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            Connection::with_link_factory(test_config(dir.path()), SimulatedDevice::factory());
        assert_eq!(
            session.start_streaming().await,
            StreamingStatus::ConnectionNotOpen
        );
    }
}
