//! Therapy control loop.
//!
//! The monitor accumulates streamed samples into a sliding window, runs
//! the classifier every quarter-window once the first full window exists,
//! and drives a hysteresis state machine that decides when therapy is
//! needed. Actual `StartTherapy`/`StopTherapy` commands are issued by
//! self-retrying workers that re-check their preconditions after every
//! await, so a decision that becomes stale mid-retry is simply dropped.
//!
//! The monitor exists only while streaming is active, but survives
//! reconnects: a worker halts while the link is down and a fresh one is
//! spawned from the `Connected` status event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cerelink_core::protocol::{DeviceError, OpCode};
use cerelink_core::types::{ConnectionStatus, StreamingSample, WINDOW_LEN};

use crate::connection::{sleep_cancellable, SessionInner};
use crate::events::DeviceEvent;
use crate::processing::classify;

/// Largest tolerated jump between consecutive sample timestamps. Anything
/// bigger is a stream discontinuity and the window restarts.
const MAX_TIMESTAMP_GAP_MS: u32 = 10;

/// Samples between classifier evaluations once the window is full.
const EVAL_STRIDE: usize = WINDOW_LEN / 4;

/// Accumulated confidence needed to enter the therapy-needed state.
const SEIZURE_START: f32 = 1.0;

/// Accumulated confidence needed to leave it. Higher on the way out so a
/// borderline signal cannot toggle therapy rapidly.
const SEIZURE_OVER: f32 = 3.0;

// ============================================================================
// Hysteresis
// ============================================================================

/// Confidence-accumulating decision filter between the raw classifier
/// output and the therapy switch.
///
/// Agreeing windows bleed accumulated evidence away (clamped at zero);
/// disagreeing windows pile it up until a threshold flips the state.
#[derive(Debug, Clone, Copy)]
pub struct Hysteresis {
    required: bool,
    accumulated: f32,
}

impl Hysteresis {
    /// Start in the therapy-not-needed state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            required: false,
            accumulated: 0.0,
        }
    }

    /// Whether therapy is currently considered needed.
    #[must_use]
    pub fn required(&self) -> bool {
        self.required
    }

    /// Feed one classification. Returns the new state when it flips.
    pub fn observe(&mut self, seizure: bool, confidence: f32) -> Option<bool> {
        if seizure == self.required {
            self.accumulated = (self.accumulated - confidence).max(0.0);
            return None;
        }

        self.accumulated += confidence;
        let threshold = if self.required { SEIZURE_OVER } else { SEIZURE_START };
        if self.accumulated >= threshold {
            self.required = !self.required;
            self.accumulated = 0.0;
            Some(self.required)
        } else {
            None
        }
    }
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Shared flags
// ============================================================================

/// Monitor state shared with the streaming listener, the log writer, and
/// the therapy workers.
#[derive(Debug, Default)]
pub(crate) struct TherapyFlags {
    /// Operator switch: may therapy be delivered at all.
    pub(crate) enabled: AtomicBool,
    /// Hysteresis output: is therapy currently needed.
    pub(crate) required: AtomicBool,
    /// Host's view of whether the device is delivering therapy.
    pub(crate) active: AtomicBool,
    /// Raw label of the most recent classification.
    pub(crate) in_seizure: AtomicBool,
}

// ============================================================================
// Monitor
// ============================================================================

/// Handle to the running therapy monitor.
pub(crate) struct TherapyMonitor {
    sample_tx: mpsc::UnboundedSender<StreamingSample>,
    flags: Arc<TherapyFlags>,
    cancel: CancellationToken,
    sample_task: tokio::task::JoinHandle<()>,
    eval_task: tokio::task::JoinHandle<()>,
    event_task: tokio::task::JoinHandle<()>,
    inner: Arc<SessionInner>,
}

impl TherapyMonitor {
    /// Start the monitor's sample, evaluation, and event tasks.
    pub(crate) fn spawn(inner: Arc<SessionInner>, therapy_enabled: bool) -> Self {
        let cancel = inner.cancel.child_token();
        let flags = Arc::new(TherapyFlags::default());
        flags.enabled.store(therapy_enabled, Ordering::Relaxed);

        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (window_tx, window_rx) = mpsc::unbounded_channel();

        let sample_task = tokio::spawn(sample_loop(sample_rx, window_tx, cancel.clone()));
        let eval_task = tokio::spawn(eval_loop(
            window_rx,
            Arc::clone(&inner),
            Arc::clone(&flags),
            cancel.clone(),
        ));
        let event_task = tokio::spawn(event_loop(
            inner.events.subscribe(),
            Arc::clone(&inner),
            Arc::clone(&flags),
            cancel.clone(),
        ));

        Self {
            sample_tx,
            flags,
            cancel,
            sample_task,
            eval_task,
            event_task,
            inner,
        }
    }

    /// Producer handle for the streaming listener.
    pub(crate) fn sample_sender(&self) -> mpsc::UnboundedSender<StreamingSample> {
        self.sample_tx.clone()
    }

    /// Shared flags, read by the log writer path.
    pub(crate) fn flags(&self) -> Arc<TherapyFlags> {
        Arc::clone(&self.flags)
    }

    /// Apply the operator's therapy switch.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.flags.enabled.store(enabled, Ordering::Relaxed);
        let _ = self.inner.events.send(DeviceEvent::TherapyEnabled(enabled));
    }

    /// Stop the monitor and its workers.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        let timeout = self.inner.config.shutdown_join_timeout;
        for (task, name) in [
            (self.sample_task, "therapy-samples"),
            (self.eval_task, "therapy-eval"),
            (self.event_task, "therapy-events"),
        ] {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(task = name, "monitor task did not stop in time; detaching");
            }
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Windowing stage: owns the sample buffer, snapshots a window every
/// [`EVAL_STRIDE`] samples, and never blocks the producer.
async fn sample_loop(
    mut samples: mpsc::UnboundedReceiver<StreamingSample>,
    windows: mpsc::UnboundedSender<[f64; WINDOW_LEN]>,
    cancel: CancellationToken,
) {
    let mut buffer: VecDeque<f64> = VecDeque::with_capacity(WINDOW_LEN);
    let mut count: u64 = 0;
    let mut last_timestamp: Option<u32> = None;

    loop {
        let sample = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sample = samples.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
        };

        if let Some(last) = last_timestamp {
            if sample.timestamp_ms.abs_diff(last) > MAX_TIMESTAMP_GAP_MS {
                debug!(
                    last,
                    now = sample.timestamp_ms,
                    "sample timestamp discontinuity; restarting window"
                );
                buffer.clear();
                count = 0;
            }
        }
        last_timestamp = Some(sample.timestamp_ms);

        if buffer.len() == WINDOW_LEN {
            buffer.pop_front();
        }
        buffer.push_back(sample.voltage_mv);
        count += 1;

        if count >= WINDOW_LEN as u64 && count % EVAL_STRIDE as u64 == 0 {
            let mut window = [0.0f64; WINDOW_LEN];
            for (slot, &value) in window.iter_mut().zip(buffer.iter()) {
                *slot = value;
            }
            if windows.send(window).is_err() {
                break;
            }
        }
    }
}

/// Evaluation stage: classifies snapshots in order and runs the
/// hysteresis state machine.
async fn eval_loop(
    mut windows: mpsc::UnboundedReceiver<[f64; WINDOW_LEN]>,
    inner: Arc<SessionInner>,
    flags: Arc<TherapyFlags>,
    cancel: CancellationToken,
) {
    let mut hysteresis = Hysteresis::new();

    loop {
        let window = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            window = windows.recv() => match window {
                Some(window) => window,
                None => break,
            },
        };

        let classification = classify(&window);
        flags
            .in_seizure
            .store(classification.seizure, Ordering::Relaxed);
        let _ = inner
            .events
            .send(DeviceEvent::Classification(classification));

        if let Some(required) =
            hysteresis.observe(classification.seizure, classification.confidence)
        {
            flags.required.store(required, Ordering::Relaxed);
            info!(required, "therapy decision changed");
            let _ = inner.events.send(DeviceEvent::TherapyRequired(required));

            if required {
                if flags.enabled.load(Ordering::Relaxed) {
                    spawn_worker(&inner, &flags, &cancel, true);
                }
            } else if flags.active.load(Ordering::Relaxed) {
                spawn_worker(&inner, &flags, &cancel, false);
            }
        }
    }
}

/// Reacts to the operator switch and to reconnects.
async fn event_loop(
    mut events: broadcast::Receiver<DeviceEvent>,
    inner: Arc<SessionInner>,
    flags: Arc<TherapyFlags>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(DeviceEvent::TherapyEnabled(enabled)) => {
                flags.enabled.store(enabled, Ordering::Relaxed);
                if enabled {
                    if flags.required.load(Ordering::Relaxed) && !flags.active.load(Ordering::Relaxed)
                    {
                        spawn_worker(&inner, &flags, &cancel, true);
                    }
                } else if flags.active.load(Ordering::Relaxed) {
                    spawn_worker(&inner, &flags, &cancel, false);
                }
            }
            Ok(DeviceEvent::Status(ConnectionStatus::Connected)) => {
                // Intent that went stale during an outage resumes here.
                let required = flags.required.load(Ordering::Relaxed);
                let active = flags.active.load(Ordering::Relaxed);
                if required && flags.enabled.load(Ordering::Relaxed) && !active {
                    spawn_worker(&inner, &flags, &cancel, true);
                } else if !required && active {
                    spawn_worker(&inner, &flags, &cancel, false);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "therapy event loop lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Spawn a self-retrying worker for one therapy transition.
///
/// The worker re-checks its preconditions before every attempt: if the
/// decision has changed, the operator switch flipped, the state was
/// already reached, or the link is down, it exits without sending.
fn spawn_worker(
    inner: &Arc<SessionInner>,
    flags: &Arc<TherapyFlags>,
    cancel: &CancellationToken,
    start: bool,
) {
    let inner = Arc::clone(inner);
    let flags = Arc::clone(flags);
    let cancel = cancel.child_token();

    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if start {
                if !flags.required.load(Ordering::Relaxed)
                    || !flags.enabled.load(Ordering::Relaxed)
                    || flags.active.load(Ordering::Relaxed)
                {
                    return;
                }
            } else if !flags.active.load(Ordering::Relaxed) {
                return;
            }
            if inner.status() != ConnectionStatus::Connected {
                // Halt for the outage; the Connected event respawns us.
                return;
            }

            let opcode = if start {
                OpCode::StartTherapy
            } else {
                OpCode::StopTherapy
            };
            match inner.transport.send_command(opcode, &[]).await {
                Ok(()) => {}
                Err(DeviceError::AlreadyDoingTherapy) if start => {}
                Err(DeviceError::AlreadyStopTherapy) if !start => {}
                Err(error) => {
                    debug!(%error, start, "therapy command failed; retrying");
                    if !sleep_cancellable(inner.config.therapy_retry_delay, &cancel).await {
                        return;
                    }
                    continue;
                }
            }

            flags.active.store(start, Ordering::Relaxed);
            info!(active = start, "therapy state updated");
            return;
        }
    });
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cerelink_core::protocol::{Packet, PacketType};

    use crate::config::LinkConfig;
    use crate::connection::test_session_inner;
    use crate::link::mock::MockLink;

    fn worker_config() -> LinkConfig {
        LinkConfig {
            write_timeout: Duration::from_millis(200),
            therapy_retry_delay: Duration::from_millis(10),
            ..LinkConfig::default()
        }
    }

    fn reply_ok(packet: &Packet) -> Packet {
        Packet {
            packet_type: PacketType::Command,
            id: packet.id,
            payload: vec![0x00],
        }
    }

    fn reply_err(packet: &Packet, code: DeviceError) -> Packet {
        Packet {
            packet_type: PacketType::Error,
            id: packet.id,
            payload: vec![code.to_byte()],
        }
    }

    async fn wait_for(flag: &AtomicBool, value: bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if flag.load(Ordering::Relaxed) == value {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_worker_retries_until_acknowledged() {
        let (link, handle) = MockLink::new();
        let mut rejections = 2;
        handle.respond_with(move |packet| {
            if rejections > 0 {
                rejections -= 1;
                vec![reply_err(packet, DeviceError::Unknown(40))]
            } else {
                vec![reply_ok(packet)]
            }
        });

        let inner = test_session_inner(worker_config(), Box::new(link)).await;
        let flags = Arc::new(TherapyFlags::default());
        flags.required.store(true, Ordering::Relaxed);
        flags.enabled.store(true, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        spawn_worker(&inner, &flags, &cancel, true);

        assert!(wait_for(&flags.active, true).await, "worker never succeeded");
        assert_eq!(handle.written().len(), 3);
        inner.cancel.cancel();
    }

    #[tokio::test]
    async fn test_start_worker_treats_already_doing_therapy_as_success() {
        let (link, handle) = MockLink::new();
        handle.respond_with(|packet| vec![reply_err(packet, DeviceError::AlreadyDoingTherapy)]);

        let inner = test_session_inner(worker_config(), Box::new(link)).await;
        let flags = Arc::new(TherapyFlags::default());
        flags.required.store(true, Ordering::Relaxed);
        flags.enabled.store(true, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        spawn_worker(&inner, &flags, &cancel, true);

        assert!(wait_for(&flags.active, true).await);
        assert_eq!(handle.written().len(), 1);
        inner.cancel.cancel();
    }

    #[tokio::test]
    async fn test_worker_halts_while_disconnected() {
        let (link, handle) = MockLink::new();
        handle.respond_with(|packet| vec![reply_ok(packet)]);

        let inner = test_session_inner(worker_config(), Box::new(link)).await;
        inner.set_status(ConnectionStatus::Disconnected);

        let flags = Arc::new(TherapyFlags::default());
        flags.required.store(true, Ordering::Relaxed);
        flags.enabled.store(true, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        spawn_worker(&inner, &flags, &cancel, true);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!flags.active.load(Ordering::Relaxed));
        assert!(handle.written().is_empty(), "no command while disconnected");
        inner.cancel.cancel();
    }

    #[tokio::test]
    async fn test_worker_drops_stale_intent() {
        let (link, handle) = MockLink::new();
        handle.respond_with(|packet| vec![reply_ok(packet)]);

        let inner = test_session_inner(worker_config(), Box::new(link)).await;
        let flags = Arc::new(TherapyFlags::default());
        // Decision already withdrawn: the worker must exit silently.
        flags.required.store(false, Ordering::Relaxed);
        flags.enabled.store(true, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        spawn_worker(&inner, &flags, &cancel, true);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.written().is_empty());
        inner.cancel.cancel();
    }

    #[tokio::test]
    async fn test_window_snapshots_follow_the_stride() {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (window_tx, mut window_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sample_loop(sample_rx, window_tx, cancel.clone()));

        // Contiguous samples, 4 ms apart. With a 178-sample window and a
        // 44-sample stride, 310 samples snapshot at counts 220, 264, 308.
        let total = WINDOW_LEN + 3 * EVAL_STRIDE;
        for i in 0..total as u32 {
            sample_tx
                .send(StreamingSample {
                    timestamp_ms: i * 4,
                    voltage_mv: f64::from(i),
                })
                .unwrap();
        }
        drop(sample_tx);
        task.await.unwrap();

        let mut windows = Vec::new();
        while let Ok(window) = window_rx.try_recv() {
            windows.push(window);
        }
        assert_eq!(windows.len(), 3);

        // Each snapshot holds the most recent 178 values, in order. The
        // first eligible count is 220, so its window spans samples
        // 42..=219.
        let first = &windows[0];
        assert_eq!(first[0], 42.0);
        assert_eq!(first[WINDOW_LEN - 1], 219.0);
        let last = &windows[2];
        assert_eq!(last[WINDOW_LEN - 1], 307.0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_timestamp_gap_restarts_the_window() {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (window_tx, mut window_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sample_loop(sample_rx, window_tx, cancel.clone()));

        // Almost a full window, then a gap far beyond the tolerance.
        for i in 0..(WINDOW_LEN - 1) as u32 {
            sample_tx
                .send(StreamingSample {
                    timestamp_ms: i * 4,
                    voltage_mv: 1.0,
                })
                .unwrap();
        }
        let resume_at = WINDOW_LEN as u32 * 4 + 500;
        for i in 0..(WINDOW_LEN - 1) as u32 {
            sample_tx
                .send(StreamingSample {
                    timestamp_ms: resume_at + i * 4,
                    voltage_mv: 2.0,
                })
                .unwrap();
        }
        drop(sample_tx);
        task.await.unwrap();

        // Neither run reached a full window, so nothing was snapshot.
        assert!(window_rx.try_recv().is_err());
        cancel.cancel();
    }

    #[test]
    fn test_hysteresis_enters_after_accumulated_evidence() {
        let mut h = Hysteresis::new();

        // Three seizure windows at 0.4 cross the 1.0 entry threshold on
        // the third.
        assert_eq!(h.observe(true, 0.4), None);
        assert_eq!(h.observe(true, 0.4), None);
        assert_eq!(h.observe(true, 0.4), Some(true));
        assert!(h.required());
    }

    #[test]
    fn test_hysteresis_exit_needs_more_evidence_than_entry() {
        let mut h = Hysteresis::new();
        h.observe(true, 1.5);
        assert!(h.required());

        // Three clean windows at 1.1 cross the 3.0 exit threshold on the
        // third.
        assert_eq!(h.observe(false, 1.1), None);
        assert_eq!(h.observe(false, 1.1), None);
        assert_eq!(h.observe(false, 1.1), Some(false));
        assert!(!h.required());
    }

    #[test]
    fn test_hysteresis_agreement_clamps_at_zero() {
        let mut h = Hysteresis::new();

        // A clean window while not-needed drives the accumulator toward
        // zero, never below it.
        h.observe(true, 0.5);
        assert_eq!(h.observe(false, 0.2), None);
        assert_eq!(h.observe(false, 10.0), None);

        // The clamp means fresh evidence starts from zero again.
        assert_eq!(h.observe(true, 0.9), None);
        assert_eq!(h.observe(true, 0.1), Some(true));
    }

    #[test]
    fn test_hysteresis_flip_resets_accumulator() {
        let mut h = Hysteresis::new();
        h.observe(true, 5.0);
        assert!(h.required());

        // Right after the flip the exit accumulator starts from zero:
        // a 2.9 clean window is not yet enough.
        assert_eq!(h.observe(false, 2.9), None);
        assert_eq!(h.observe(false, 0.1), Some(false));
    }
}
