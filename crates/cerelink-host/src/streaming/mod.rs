//! Streaming session controller.
//!
//! Activates streaming at the device, decodes every `StreamData` frame,
//! and tees the sample three ways: onto the session event bus, into the
//! therapy monitor, and onto the CSV log queue. The controller spans
//! reconnects: when the session comes back it re-activates the stream,
//! keeping at most one activation attempt in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cerelink_core::protocol::{DeviceError, OpCode, PacketType};
use cerelink_core::types::{ConnectionStatus, StreamingSample};

use crate::connection::{sleep_cancellable, SessionInner};
use crate::dispatch::ListenerId;
use crate::events::DeviceEvent;
use crate::therapy::TherapyMonitor;

mod log;

use self::log::{LogRecord, SampleLog};

/// Handle to the active streaming session.
pub(crate) struct StreamingController {
    inner: Arc<SessionInner>,
    cancel: CancellationToken,
    listener: ListenerId,
    monitor: TherapyMonitor,
    sample_log: Option<SampleLog>,
    status_task: tokio::task::JoinHandle<()>,
}

impl StreamingController {
    /// Build the controller: spawn the therapy monitor, open the log,
    /// register the stream listener, and activate streaming at the
    /// device before returning.
    pub(crate) async fn start(inner: Arc<SessionInner>, therapy_enabled: bool) -> Self {
        let cancel = inner.cancel.child_token();
        let monitor = TherapyMonitor::spawn(Arc::clone(&inner), therapy_enabled);

        let sample_log = match SampleLog::create(&inner.config.stream_log_path) {
            Ok(log) => {
                info!(path = %log.path().display(), "streaming log open");
                Some(log)
            }
            Err(error) => {
                warn!(%error, "could not open streaming log; continuing without it");
                None
            }
        };

        let events = inner.events.clone();
        let samples = monitor.sample_sender();
        let flags = monitor.flags();
        let log_tx = sample_log.as_ref().map(SampleLog::sender);
        let listener = inner.dispatcher.register(
            PacketType::StreamData,
            false,
            Box::new(move |packet| {
                let Some(sample) = StreamingSample::from_payload(&packet.payload) else {
                    warn!(len = packet.payload.len(), "stream frame payload too short");
                    return Ok(true);
                };
                let _ = events.send(DeviceEvent::Sample(sample));
                let _ = samples.send(sample);
                if let Some(log_tx) = &log_tx {
                    let _ = log_tx.send(LogRecord {
                        timestamp_ms: sample.timestamp_ms,
                        voltage_mv: sample.voltage_mv,
                        in_seizure: flags.in_seizure.load(Ordering::Relaxed),
                        therapy_required: flags.required.load(Ordering::Relaxed),
                    });
                }
                // Stream frames are always consumed here.
                Ok(true)
            }),
        );

        // Subscribe before the first activation so a reconnect racing it
        // is still observed.
        let status_events = inner.events.subscribe();

        // First activation happens inline so the caller observes a live
        // stream; re-activations after reconnect are spawned.
        activate_stream(&inner, &cancel).await;

        let status_task = tokio::spawn(status_loop(
            status_events,
            Arc::clone(&inner),
            cancel.clone(),
        ));

        Self {
            inner,
            cancel,
            listener,
            monitor,
            sample_log,
            status_task,
        }
    }

    /// Forward the operator's therapy switch to the monitor.
    pub(crate) fn set_therapy_enabled(&self, enabled: bool) {
        self.monitor.set_enabled(enabled);
    }

    /// Tear the streaming session down.
    ///
    /// The therapy monitor dies first, then the stream is deactivated at
    /// the device, the listener unregistered, and the log writer drained.
    pub(crate) async fn shutdown(self) {
        self.monitor.shutdown().await;
        self.cancel.cancel();

        deactivate_stream(&self.inner).await;

        let _ = self
            .inner
            .dispatcher
            .unregister(PacketType::StreamData, self.listener);

        let join_timeout = self.inner.config.shutdown_join_timeout;
        if tokio::time::timeout(join_timeout, self.status_task)
            .await
            .is_err()
        {
            warn!("streaming status task did not stop in time; detaching");
        }

        if let Some(log) = self.sample_log {
            log.close(join_timeout).await;
        }
    }
}

/// Ask the device to start streaming, retrying until it agrees or the
/// controller is cancelled. `AlreadyStreaming` counts as agreement.
async fn activate_stream(inner: &SessionInner, cancel: &CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match inner
            .transport
            .send_command(OpCode::StartStreaming, &[])
            .await
        {
            Ok(()) | Err(DeviceError::AlreadyStreaming) => {
                info!("streaming active");
                return;
            }
            Err(error) => {
                debug!(%error, "stream activation failed; retrying");
                if !sleep_cancellable(inner.config.stream_retry_delay, cancel).await {
                    return;
                }
            }
        }
    }
}

/// Ask the device to stop streaming. Only a checksum rejection or a
/// missing reply is worth another attempt.
async fn deactivate_stream(inner: &SessionInner) {
    for attempt in 1..=inner.config.stream_cancel_attempts {
        match inner
            .transport
            .send_command(OpCode::StopStreaming, &[])
            .await
        {
            Ok(()) | Err(DeviceError::AlreadyStopStreaming) => return,
            Err(error @ (DeviceError::BadChecksum | DeviceError::TimeoutExpired)) => {
                debug!(%error, attempt, "stream deactivation retry");
            }
            Err(error) => {
                warn!(%error, "stream deactivation failed");
                return;
            }
        }
    }
}

/// Watch for reconnects and re-activate the stream, one attempt in
/// flight at a time.
async fn status_loop(
    mut events: broadcast::Receiver<DeviceEvent>,
    inner: Arc<SessionInner>,
    cancel: CancellationToken,
) {
    let in_flight = Arc::new(AtomicBool::new(false));
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(DeviceEvent::Status(ConnectionStatus::Connected)) => {
                if !in_flight.swap(true, Ordering::SeqCst) {
                    let inner = Arc::clone(&inner);
                    let cancel = cancel.clone();
                    let in_flight = Arc::clone(&in_flight);
                    tokio::spawn(async move {
                        activate_stream(&inner, &cancel).await;
                        in_flight.store(false, Ordering::SeqCst);
                    });
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "streaming status loop lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
