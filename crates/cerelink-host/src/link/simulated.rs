//! In-process simulated device.
//!
//! `SimulatedDevice` implements [`SerialLink`] by speaking the device's own
//! wire protocol: it parses host frames, acknowledges or rejects commands
//! according to its session state, and, while streaming is active, emits a
//! synthetic neural signal at a fixed sample rate. The app's `--simulate`
//! mode and the integration tests run the full driver stack against it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cerelink_core::protocol::{DeviceError, Framer, FramerEvent, OpCode, Packet, PacketType};
use cerelink_core::types::StreamingSample;

use super::{LinkFactory, LinkResult, SerialLink};

/// Milliseconds of signal per synthetic sample (250 Hz).
const SAMPLE_PERIOD_MS: u32 = 4;

/// How long `read_byte` dozes when it has nothing to deliver.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

struct SimState {
    framer: Framer,
    outbound: VecDeque<u8>,
    connected: bool,
    streaming: bool,
    therapy: bool,
    stream_id: u8,
    started: Instant,
    samples_emitted: u64,
}

impl SimState {
    fn new() -> Self {
        Self {
            framer: Framer::new(),
            outbound: VecDeque::new(),
            connected: false,
            streaming: false,
            therapy: false,
            stream_id: 0,
            started: Instant::now(),
            samples_emitted: 0,
        }
    }

    fn ack(&mut self, id: u8) {
        let reply = Packet {
            packet_type: PacketType::Command,
            id,
            payload: vec![0x00],
        };
        self.outbound.extend(reply.to_frame());
    }

    fn reject(&mut self, id: u8, code: DeviceError) {
        let reply = Packet {
            packet_type: PacketType::Error,
            id,
            payload: vec![code.to_byte()],
        };
        self.outbound.extend(reply.to_frame());
    }

    fn handle_command(&mut self, packet: &Packet) {
        let Some(opcode) = packet.payload.first().copied().and_then(OpCode::from_byte) else {
            self.reject(packet.id, DeviceError::BadOpCode);
            return;
        };

        if !self.connected && opcode != OpCode::InitialConnection {
            self.reject(packet.id, DeviceError::NotConnected);
            return;
        }

        match opcode {
            OpCode::InitialConnection => {
                if self.connected {
                    self.reject(packet.id, DeviceError::AlreadyConnected);
                } else {
                    self.connected = true;
                    self.ack(packet.id);
                }
            }
            OpCode::WatchdogReset => self.ack(packet.id),
            OpCode::StartStreaming => {
                if self.streaming {
                    self.reject(packet.id, DeviceError::AlreadyStreaming);
                } else {
                    self.streaming = true;
                    self.ack(packet.id);
                }
            }
            OpCode::StopStreaming => {
                if self.streaming {
                    self.streaming = false;
                    self.ack(packet.id);
                } else {
                    self.reject(packet.id, DeviceError::AlreadyStopStreaming);
                }
            }
            OpCode::StartTherapy => {
                if self.therapy {
                    self.reject(packet.id, DeviceError::AlreadyDoingTherapy);
                } else {
                    self.therapy = true;
                    self.ack(packet.id);
                }
            }
            OpCode::StopTherapy => {
                if self.therapy {
                    self.therapy = false;
                    self.ack(packet.id);
                } else {
                    self.reject(packet.id, DeviceError::AlreadyStopTherapy);
                }
            }
        }
    }

    /// Queue any stream samples that are due at the current wall clock.
    fn pump_stream(&mut self) {
        if !self.streaming {
            return;
        }
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        while self.samples_emitted * u64::from(SAMPLE_PERIOD_MS) <= elapsed_ms {
            let timestamp_ms = (self.samples_emitted * u64::from(SAMPLE_PERIOD_MS)) as u32;
            let sample = StreamingSample {
                timestamp_ms,
                voltage_mv: synthetic_voltage(timestamp_ms),
            };
            let frame = Packet {
                packet_type: PacketType::StreamData,
                id: self.stream_id,
                payload: sample.to_payload(),
            }
            .to_frame();
            self.outbound.extend(frame);
            self.stream_id = self.stream_id.wrapping_add(1);
            self.samples_emitted += 1;
        }
    }
}

/// Mixture of a 5 Hz and a 12 Hz component, loosely alpha-band-shaped.
fn synthetic_voltage(timestamp_ms: u32) -> f64 {
    let t = f64::from(timestamp_ms) / 1000.0;
    40.0 * (2.0 * std::f64::consts::PI * 5.0 * t).sin()
        + 15.0 * (2.0 * std::f64::consts::PI * 12.0 * t).sin()
}

/// A fake stimulator living entirely in process.
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// Create a fresh device in the unconnected state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// A [`LinkFactory`] that opens a new simulated device per call.
    ///
    /// Reconnecting through this factory yields a device with cleared
    /// session state, the same as power-cycling real hardware.
    #[must_use]
    pub fn factory() -> LinkFactory {
        Arc::new(|_name, _config| Ok(Box::new(SimulatedDevice::new()) as Box<dyn SerialLink>))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink for SimulatedDevice {
    fn read_byte(&mut self) -> LinkResult<Option<u8>> {
        {
            let mut state = self.lock();
            state.pump_stream();
            if let Some(byte) = state.outbound.pop_front() {
                return Ok(Some(byte));
            }
        }
        // Nothing pending; behave like a quiet port with a short timeout.
        std::thread::sleep(IDLE_SLEEP);
        Ok(None)
    }

    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        let mut state = self.lock();
        for &byte in bytes {
            if let Some(FramerEvent::Frame(packet)) = state.framer.push(byte) {
                match packet.packet_type {
                    PacketType::Command => state.handle_command(&packet),
                    _ => state.reject(packet.id, DeviceError::BadPacketType),
                }
            }
        }
        Ok(())
    }

    fn try_clone(&self) -> LinkResult<Box<dyn SerialLink>> {
        Ok(Box::new(SimulatedDevice {
            state: Arc::clone(&self.state),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(device: &mut SimulatedDevice, packet: &Packet) -> Packet {
        device.write_all(&packet.to_frame()).unwrap();
        let mut framer = Framer::new();
        loop {
            if let Some(byte) = device.read_byte().unwrap() {
                if let Some(FramerEvent::Frame(reply)) = framer.push(byte) {
                    return reply;
                }
            }
        }
    }

    #[test]
    fn test_handshake_then_duplicate_rejected() {
        let mut device = SimulatedDevice::new();

        let hello = Packet::command(1, OpCode::InitialConnection, &[]);
        let reply = exchange(&mut device, &hello);
        assert_eq!(reply.packet_type, PacketType::Command);
        assert_eq!(reply.id, 1);

        let again = Packet::command(2, OpCode::InitialConnection, &[]);
        let reply = exchange(&mut device, &again);
        assert_eq!(reply.error_code(), Some(DeviceError::AlreadyConnected));
    }

    #[test]
    fn test_commands_require_session() {
        let mut device = SimulatedDevice::new();
        let ping = Packet::command(9, OpCode::WatchdogReset, &[]);
        let reply = exchange(&mut device, &ping);
        assert_eq!(reply.error_code(), Some(DeviceError::NotConnected));
    }

    #[test]
    fn test_streaming_emits_samples() {
        let mut device = SimulatedDevice::new();
        exchange(&mut device, &Packet::command(1, OpCode::InitialConnection, &[]));
        exchange(&mut device, &Packet::command(2, OpCode::StartStreaming, &[]));

        std::thread::sleep(Duration::from_millis(20));

        let mut framer = Framer::new();
        let deadline = Instant::now() + Duration::from_millis(200);
        let mut samples = 0;
        while Instant::now() < deadline && samples < 3 {
            if let Some(byte) = device.read_byte().unwrap() {
                if let Some(FramerEvent::Frame(packet)) = framer.push(byte) {
                    assert_eq!(packet.packet_type, PacketType::StreamData);
                    assert!(StreamingSample::from_payload(&packet.payload).is_some());
                    samples += 1;
                }
            }
        }
        assert!(samples >= 3, "expected streamed samples, got {samples}");
    }
}
