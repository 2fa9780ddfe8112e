//! Inbound packet dispatch.
//!
//! Frames decoded by the reader are queued onto a bounded channel and
//! consumed by a single dispatch task. Each packet is offered to the
//! listeners registered for its type, in registration order; the first
//! listener to claim it wins, and a one-shot listener is removed before the
//! next packet is taken from the queue.
//!
//! Device error replies arrive as `Error` frames even when they answer a
//! command, so an unclaimed `Error` packet is re-offered to the `Command`
//! listener list before being dropped. That is how an in-flight
//! `send_command` learns that its reply was an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cerelink_core::protocol::{Packet, PacketType};

/// Error reported by a listener callback.
///
/// The dispatch loop logs it and moves on to the next listener; a failing
/// listener never stalls the queue.
#[derive(Debug, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Listener outcome: `Ok(true)` claims the packet, `Ok(false)` passes.
pub type ListenerResult = Result<bool, ListenerError>;

/// Boxed listener callback.
pub type ListenerFn = Box<dyn FnMut(&Packet) -> ListenerResult + Send>;

/// Token identifying one registration.
///
/// Registrations are unique by token, not by callback value: registering
/// the same closure body twice yields two independent entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Errors from listener-table operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// No registration with that token exists for the type.
    #[error("no listener with that id registered for {0:?}")]
    NotFound(PacketType),
}

struct ListenerEntry {
    id: u64,
    one_shot: bool,
    handler: ListenerFn,
}

type ListenerTable = HashMap<PacketType, Vec<ListenerEntry>>;

/// Single-consumer packet router.
pub struct Dispatcher {
    tx: mpsc::Sender<Packet>,
    table: Arc<Mutex<ListenerTable>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the dispatcher and its consumer task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(queue_capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let table: Arc<Mutex<ListenerTable>> = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(dispatch_loop(rx, Arc::clone(&table), cancel.clone()));

        Arc::new(Self {
            tx,
            table,
            next_id: AtomicU64::new(1),
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// A producer handle for the inbound queue.
    ///
    /// The reader thread feeds decoded frames through this with
    /// `blocking_send`.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Packet> {
        self.tx.clone()
    }

    /// Register a listener for a packet type.
    ///
    /// Listeners fire in registration order and must not block: they run on
    /// the dispatch task.
    pub fn register(
        &self,
        packet_type: PacketType,
        one_shot: bool,
        handler: ListenerFn,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = lock_table(&self.table);
        table
            .entry(packet_type)
            .or_default()
            .push(ListenerEntry { id, one_shot, handler });
        ListenerId(id)
    }

    /// Remove the registration with the given token.
    ///
    /// Safe to call while dispatch is running; removal is atomic against
    /// the dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotFound`] if no such registration exists,
    /// which is routine when a one-shot listener already consumed its
    /// packet.
    pub fn unregister(&self, packet_type: PacketType, id: ListenerId) -> Result<(), DispatchError> {
        let mut table = lock_table(&self.table);
        let listeners = table
            .get_mut(&packet_type)
            .ok_or(DispatchError::NotFound(packet_type))?;
        let index = listeners
            .iter()
            .position(|entry| entry.id == id.0)
            .ok_or(DispatchError::NotFound(packet_type))?;
        listeners.remove(index);
        Ok(())
    }

    /// Stop the consumer task, waiting up to `join_timeout` for it.
    pub async fn shutdown(&self, join_timeout: Duration) {
        self.cancel.cancel();
        let worker = lock_worker(&self.worker).take();
        if let Some(worker) = worker {
            if tokio::time::timeout(join_timeout, worker).await.is_err() {
                warn!("dispatch task did not stop in time; detaching");
            }
        }
    }
}

fn lock_table(table: &Mutex<ListenerTable>) -> std::sync::MutexGuard<'_, ListenerTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_worker(
    worker: &Mutex<Option<tokio::task::JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
    worker.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<Packet>,
    table: Arc<Mutex<ListenerTable>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                dispatch_one(&table, &packet);
            }
        }
    }
}

fn dispatch_one(table: &Mutex<ListenerTable>, packet: &Packet) {
    let mut table = lock_table(table);

    if offer(&mut table, packet.packet_type, packet) {
        return;
    }

    // Fallback path. Error frames may be replies to an in-flight command;
    // everything else unclaimed is only worth a log line.
    if packet.packet_type == PacketType::Error && offer(&mut table, PacketType::Command, packet) {
        return;
    }

    debug!(
        packet_type = ?packet.packet_type,
        id = packet.id,
        "packet not claimed by any listener"
    );
}

/// Offer `packet` to the listener list for `slot`. Returns whether a
/// listener claimed it. A claiming one-shot listener is removed before
/// this function returns.
fn offer(table: &mut ListenerTable, slot: PacketType, packet: &Packet) -> bool {
    let Some(listeners) = table.get_mut(&slot) else {
        return false;
    };

    let mut claimed = None;
    for (index, entry) in listeners.iter_mut().enumerate() {
        match (entry.handler)(packet) {
            Ok(true) => {
                claimed = Some(index);
                break;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "listener error; continuing"),
        }
    }

    match claimed {
        Some(index) => {
            if listeners[index].one_shot {
                listeners.remove(index);
            }
            true
        }
        None => false,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn packet(packet_type: PacketType, id: u8) -> Packet {
        Packet {
            packet_type,
            id,
            payload: vec![0x00],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_listeners_fire_in_registration_order() {
        let dispatcher = Dispatcher::start(16);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.register(
                PacketType::Command,
                false,
                Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                    // Only the second listener claims.
                    Ok(tag == "second")
                }),
            );
        }

        dispatcher.sender().send(packet(PacketType::Command, 1)).await.unwrap();
        settle().await;

        // Iteration stopped at the claimant; the third never fired.
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_one_shot_listener_removed_after_claim() {
        let dispatcher = Dispatcher::start(16);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        dispatcher.register(
            PacketType::Command,
            true,
            Box::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        );

        let sender = dispatcher.sender();
        sender.send(packet(PacketType::Command, 1)).await.unwrap();
        sender.send(packet(PacketType::Command, 2)).await.unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_error_fallback_reaches_command_listeners() {
        let dispatcher = Dispatcher::start(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        dispatcher.register(
            PacketType::Command,
            false,
            Box::new(move |p| {
                seen_clone.lock().unwrap().push((p.packet_type, p.id));
                Ok(true)
            }),
        );

        dispatcher.sender().send(packet(PacketType::Error, 9)).await.unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![(PacketType::Error, 9)]);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_later_ones() {
        let dispatcher = Dispatcher::start(16);
        let claimed = Arc::new(AtomicUsize::new(0));

        dispatcher.register(
            PacketType::StreamData,
            false,
            Box::new(|_| Err(ListenerError("synthetic failure".into()))),
        );
        let claimed_clone = Arc::clone(&claimed);
        dispatcher.register(
            PacketType::StreamData,
            false,
            Box::new(move |_| {
                claimed_clone.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        );

        dispatcher.sender().send(packet(PacketType::StreamData, 3)).await.unwrap();
        settle().await;

        assert_eq!(claimed.load(Ordering::SeqCst), 1);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unregister_by_token() {
        let dispatcher = Dispatcher::start(16);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = dispatcher.register(
            PacketType::Command,
            false,
            Box::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        );

        dispatcher.unregister(PacketType::Command, id).unwrap();
        assert_eq!(
            dispatcher.unregister(PacketType::Command, id),
            Err(DispatchError::NotFound(PacketType::Command))
        );

        dispatcher.sender().send(packet(PacketType::Command, 1)).await.unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_duplicate_registrations_are_independent() {
        let dispatcher = Dispatcher::start(16);
        let hits = Arc::new(AtomicUsize::new(0));

        let make = |hits: Arc<AtomicUsize>| -> ListenerFn {
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            })
        };

        let a = dispatcher.register(PacketType::Command, false, make(Arc::clone(&hits)));
        let b = dispatcher.register(PacketType::Command, false, make(Arc::clone(&hits)));
        assert_ne!(a, b);

        // Removing one leaves the other registered.
        dispatcher.unregister(PacketType::Command, a).unwrap();
        dispatcher.sender().send(packet(PacketType::Command, 1)).await.unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }
}
