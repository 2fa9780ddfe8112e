//! Scripted byte-level link for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cerelink_core::protocol::{Framer, FramerEvent, Packet};

use super::{LinkError, LinkResult, SerialLink};

type Responder = Box<dyn FnMut(&Packet) -> Vec<Packet> + Send>;

#[derive(Default)]
pub(crate) struct MockState {
    inbound: VecDeque<u8>,
    written: Vec<Packet>,
    framer: Framer,
    responder: Option<Responder>,
    fail_writes: bool,
}

/// Shared handle the test uses to script the device side.
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Packets the host has written so far.
    pub fn written(&self) -> Vec<Packet> {
        self.lock().written.clone()
    }

    /// Install a responder invoked for every packet the host writes.
    pub fn respond_with(&self, responder: impl FnMut(&Packet) -> Vec<Packet> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Make subsequent writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

/// A [`SerialLink`] whose device side is driven by the test.
pub(crate) struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockHandle { state },
        )
    }
}

impl SerialLink for MockLink {
    fn read_byte(&mut self) -> LinkResult<Option<u8>> {
        let byte = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.inbound.pop_front()
        };
        if byte.is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(byte)
    }

    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_writes {
            return Err(LinkError::Closed);
        }
        for &byte in bytes {
            let frame = match state.framer.push(byte) {
                Some(FramerEvent::Frame(packet)) => packet,
                _ => continue,
            };
            state.written.push(frame.clone());
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(&frame),
                None => Vec::new(),
            };
            for reply in replies {
                state.inbound.extend(reply.to_frame());
            }
        }
        Ok(())
    }

    fn try_clone(&self) -> LinkResult<Box<dyn SerialLink>> {
        Ok(Box::new(MockLink {
            state: Arc::clone(&self.state),
        }))
    }
}
