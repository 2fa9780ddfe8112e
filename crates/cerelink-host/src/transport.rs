//! Synchronous command/reply primitive.
//!
//! `send_command` builds a command frame, registers a one-shot listener
//! keyed on the frame's sequence id, writes the frame under the exclusive
//! port write lock, and waits for the matching reply or a timeout. The
//! listener is registered before the write so a reply racing the write
//! cannot be lost.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{trace, warn};

use cerelink_core::protocol::{DeviceError, OpCode, Packet, PacketType};

use crate::connection::SessionStats;
use crate::dispatch::Dispatcher;
use crate::link::SerialLink;

/// Outbound frame writer with reply correlation.
///
/// The writer half of the port lives behind an async mutex; the lock is
/// held only across the write itself, so the inbound path and concurrent
/// waiters are unaffected by a slow reply.
pub struct Transport {
    writer: Mutex<Option<Box<dyn SerialLink>>>,
    dispatcher: Arc<Dispatcher>,
    sequence: AtomicU32,
    write_timeout: Duration,
    stats: Arc<SessionStats>,
}

impl Transport {
    /// Create a transport with no writer attached.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        write_timeout: Duration,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            writer: Mutex::new(None),
            dispatcher,
            sequence: AtomicU32::new(0),
            write_timeout,
            stats,
        }
    }

    /// Attach the writer half of a (re)opened port.
    pub async fn set_writer(&self, link: Box<dyn SerialLink>) {
        *self.writer.lock().await = Some(link);
    }

    /// Detach the writer; subsequent commands fail with `NotOpen`.
    pub async fn clear_writer(&self) {
        *self.writer.lock().await = None;
    }

    /// Whether a writer is currently attached.
    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Claim the next sequence id.
    fn next_id(&self) -> u8 {
        (self.sequence.fetch_add(1, Ordering::Relaxed) % 256) as u8
    }

    /// Send a command and wait for the device's reply.
    ///
    /// Returns `Ok(())` on a confirmed reply. A device error reply
    /// surfaces as `Err` with the device's code; `TimeoutExpired`,
    /// `ComFailed`, and `NotOpen` are synthesized by the host.
    ///
    /// # Errors
    ///
    /// See [`DeviceError`] for the full set of outcomes.
    pub async fn send_command(&self, opcode: OpCode, data: &[u8]) -> Result<(), DeviceError> {
        let id = self.next_id();
        let frame = Packet::command(id, opcode, data).to_frame();

        // Register the reply listener before writing so a fast reply
        // cannot slip past between the write returning and the wait
        // beginning.
        let (reply_tx, reply_rx) = oneshot::channel::<Result<(), DeviceError>>();
        let mut slot = Some(reply_tx);
        let listener = self.dispatcher.register(
            PacketType::Command,
            true,
            Box::new(move |packet: &Packet| {
                if packet.id != id {
                    return Ok(false);
                }
                let verdict = match packet.error_code() {
                    Some(code) => Err(code),
                    None => Ok(()),
                };
                if let Some(tx) = slot.take() {
                    let _ = tx.send(verdict);
                }
                Ok(true)
            }),
        );

        {
            let mut writer = self.writer.lock().await;
            let Some(link) = writer.as_mut() else {
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                return Err(DeviceError::NotOpen);
            };
            if let Err(e) = link.write_all(&frame) {
                warn!(error = %e, ?opcode, "serial write failed");
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                return Err(DeviceError::ComFailed);
            }
        }
        self.stats.note_packet_sent();
        trace!(?opcode, id, "command written");

        match tokio::time::timeout(self.write_timeout, reply_rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => {
                // Reply channel dropped without firing: dispatcher gone.
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                Err(DeviceError::ComFailed)
            }
            Err(_) => {
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                Err(DeviceError::TimeoutExpired)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
