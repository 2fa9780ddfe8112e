//! Wire protocol for the stimulator serial link.
//!
//! Every frame on the link has the same shape:
//!
//! ```text
//! +-------+------+------+------+------+------+---------+----------+
//! | 0xAA  | 0x01 | 0x02 | TYPE |  ID  | SIZE | PAYLOAD | CHECKSUM |
//! +-------+------+------+------+------+------+---------+----------+
//! ```
//!
//! `SIZE` counts payload bytes (1..=254). The checksum is the low 8 bits of
//! the sum of every frame byte after the 0xAA start marker, payload
//! included. The protocol is self-synchronizing: a parser that loses its
//! place simply scans forward to the next 0xAA.
//!
//! Command payloads start with an [`OpCode`]; error payloads start with a
//! [`DeviceError`] code; stream-data payloads carry a little-endian `u32`
//! timestamp and `u16` reading.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

// ============================================================================
// Frame Constants
// ============================================================================

/// Start-of-frame marker.
pub const START_BYTE: u8 = 0xAA;

/// Protocol version bytes following the start marker.
pub const VERSION: [u8; 2] = [0x01, 0x02];

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD: usize = 254;

/// Shortest legal frame (SIZE = 1): start, version, type, id, size, one
/// payload byte, checksum.
pub const MIN_FRAME_LEN: usize = 8;

/// Longest legal frame (SIZE = 254).
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN - 1 + MAX_PAYLOAD;

/// Compute the wire checksum: the wrapping sum of `bytes`.
///
/// Callers pass the frame bytes after the start marker, up to but not
/// including the checksum byte itself.
#[must_use]
pub fn wire_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

// ============================================================================
// Packet Types
// ============================================================================

/// Packet type tag, the fourth byte of every frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Device-reported error (payload carries a [`DeviceError`] code)
    Error = 0,
    /// Command or command acknowledgement
    Command = 1,
    /// Streamed neural-signal sample
    StreamData = 2,
}

impl PacketType {
    /// Try to convert a byte to a packet type.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Error),
            1 => Some(Self::Command),
            2 => Some(Self::StreamData),
            _ => None,
        }
    }
}

// ============================================================================
// OpCodes
// ============================================================================

/// Command opcode, the first payload byte of a Command packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    /// Session handshake
    InitialConnection = 1,
    /// Watchdog keepalive ping
    WatchdogReset = 2,
    /// Begin sample streaming
    StartStreaming = 3,
    /// End sample streaming
    StopStreaming = 4,
    /// Begin therapeutic stimulation
    StartTherapy = 5,
    /// End therapeutic stimulation
    StopTherapy = 6,
}

impl OpCode {
    /// Try to convert a byte to an opcode.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::InitialConnection),
            2 => Some(Self::WatchdogReset),
            3 => Some(Self::StartStreaming),
            4 => Some(Self::StopStreaming),
            5 => Some(Self::StartTherapy),
            6 => Some(Self::StopTherapy),
            _ => None,
        }
    }
}

// ============================================================================
// Device Error Codes
// ============================================================================

/// Error codes carried in the first payload byte of an Error packet, plus
/// the host-synthesized codes in the 252..=255 range that never appear on
/// the wire.
///
/// [`crate::protocol::DeviceError`] doubles as the error type of the host's
/// command path: a command either gets a device acknowledgement, a device
/// error code, or one of the synthesized outcomes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum DeviceError {
    /// Frame failed checksum verification at the device
    #[error("device rejected frame: bad checksum")]
    BadChecksum,
    /// Declared payload length exceeded the device maximum
    #[error("device rejected frame: payload length exceeds maximum")]
    PayloadLengthExceedsMax,
    /// Unknown packet type byte
    #[error("device rejected frame: bad packet type")]
    BadPacketType,
    /// Unknown opcode byte
    #[error("device rejected command: bad opcode")]
    BadOpCode,
    /// Handshake received while a session is already established
    #[error("device already connected")]
    AlreadyConnected,
    /// Stream start received while already streaming
    #[error("device already streaming")]
    AlreadyStreaming,
    /// Stream stop received while not streaming
    #[error("device already stopped streaming")]
    AlreadyStopStreaming,
    /// Command received before a session handshake
    #[error("device not connected")]
    NotConnected,
    /// Therapy start received while therapy is active
    #[error("device already delivering therapy")]
    AlreadyDoingTherapy,
    /// Therapy stop received while therapy is inactive
    #[error("device already stopped therapy")]
    AlreadyStopTherapy,
    /// Host-synthesized: the operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
    /// Host-synthesized: the transport is not open
    #[error("transport not open")]
    NotOpen,
    /// Host-synthesized: no matching reply arrived in time
    #[error("timeout waiting for device reply")]
    TimeoutExpired,
    /// Host-synthesized: writing to the port failed
    #[error("serial write failed")]
    ComFailed,
    /// Unrecognized wire code
    #[error("unknown device error code 0x{0:02X}")]
    Unknown(u8),
}

impl DeviceError {
    /// Decode a wire byte into an error code.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::BadChecksum,
            1 => Self::PayloadLengthExceedsMax,
            2 => Self::BadPacketType,
            3 => Self::BadOpCode,
            4 => Self::AlreadyConnected,
            5 => Self::AlreadyStreaming,
            6 => Self::AlreadyStopStreaming,
            7 => Self::NotConnected,
            8 => Self::AlreadyDoingTherapy,
            9 => Self::AlreadyStopTherapy,
            252 => Self::Cancelled,
            253 => Self::NotOpen,
            254 => Self::TimeoutExpired,
            255 => Self::ComFailed,
            other => Self::Unknown(other),
        }
    }

    /// Encode the error code as its wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::BadChecksum => 0,
            Self::PayloadLengthExceedsMax => 1,
            Self::BadPacketType => 2,
            Self::BadOpCode => 3,
            Self::AlreadyConnected => 4,
            Self::AlreadyStreaming => 5,
            Self::AlreadyStopStreaming => 6,
            Self::NotConnected => 7,
            Self::AlreadyDoingTherapy => 8,
            Self::AlreadyStopTherapy => 9,
            Self::Cancelled => 252,
            Self::NotOpen => 253,
            Self::TimeoutExpired => 254,
            Self::ComFailed => 255,
            Self::Unknown(b) => b,
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A decoded frame: type tag, sequence id, and payload.
///
/// A `Packet` produced by [`Framer`] has already passed checksum
/// verification. The payload length is always the declared SIZE.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Packet type tag
    pub packet_type: PacketType,
    /// 8-bit sequence id assigned by the originator
    pub id: u8,
    /// Opaque payload, 1..=254 bytes
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a command packet: payload is the opcode followed by `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 253 bytes (opcode plus data must fit
    /// the 254-byte payload limit). Command payloads in this protocol are a
    /// handful of bytes; the limit is structural, not operational.
    #[must_use]
    pub fn command(id: u8, opcode: OpCode, data: &[u8]) -> Self {
        assert!(data.len() < MAX_PAYLOAD, "command data exceeds payload limit");
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(opcode as u8);
        payload.extend_from_slice(data);
        Self { packet_type: PacketType::Command, id, payload }
    }

    /// Serialize the packet to its full wire frame, checksum included.
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        debug_assert!(!self.payload.is_empty() && self.payload.len() <= MAX_PAYLOAD);

        let mut frame = Vec::with_capacity(MIN_FRAME_LEN - 1 + self.payload.len());
        frame.push(START_BYTE);
        frame.extend_from_slice(&VERSION);
        frame.push(self.packet_type as u8);
        frame.push(self.id);
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);
        frame.push(wire_checksum(&frame[1..]));
        frame
    }

    /// For an Error packet, the device error code in the first payload byte.
    ///
    /// Returns `None` for other packet types.
    #[must_use]
    pub fn error_code(&self) -> Option<DeviceError> {
        if self.packet_type == PacketType::Error {
            self.payload.first().map(|&b| DeviceError::from_byte(b))
        } else {
            None
        }
    }
}

// ============================================================================
// Framer
// ============================================================================

/// Events emitted by [`Framer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerEvent {
    /// A complete, checksum-verified frame.
    Frame(Packet),
    /// Malformed input was discarded; the parser has resynchronized.
    Error(FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    Sync,
    Version0,
    Version1,
    Kind,
    Id,
    Size,
    Payload,
    Checksum,
}

/// Reentrant byte-at-a-time frame parser.
///
/// Feed it one byte at a time with [`Framer::push`]; it emits a
/// [`FramerEvent::Frame`] when a checksum-verified frame completes and a
/// [`FramerEvent::Error`] when bytes had to be discarded. It never fails
/// permanently: after any error it scans forward to the next start marker.
///
/// The parser consumes every byte exactly once. A byte that breaks the
/// current frame is re-examined as a potential start marker, so a frame
/// beginning immediately after garbage is not lost.
#[derive(Debug)]
pub struct Framer {
    state: FramerState,
    sum: u8,
    kind: PacketType,
    id: u8,
    size: u8,
    payload: Vec<u8>,
    desync_reported: bool,
}

impl Framer {
    /// Create a parser waiting for the first start marker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: FramerState::Sync,
            sum: 0,
            kind: PacketType::Error,
            id: 0,
            size: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD),
            desync_reported: false,
        }
    }

    /// Whether the parser is inside a partially received frame.
    ///
    /// The reader loop uses this to distinguish a read timeout mid-frame
    /// (worth logging) from one between frames (expected idle).
    #[must_use]
    pub fn mid_frame(&self) -> bool {
        self.state != FramerState::Sync
    }

    /// Advance the state machine by one byte.
    pub fn push(&mut self, byte: u8) -> Option<FramerEvent> {
        match self.state {
            FramerState::Sync => {
                if byte == START_BYTE {
                    self.begin_frame();
                    None
                } else if self.desync_reported {
                    None
                } else {
                    self.desync_reported = true;
                    Some(FramerEvent::Error(FrameError::Desync { got: byte }))
                }
            }
            FramerState::Version0 => {
                if byte == VERSION[0] {
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = FramerState::Version1;
                    None
                } else {
                    self.resync(byte, FrameError::BadVersion { offset: 1, got: byte })
                }
            }
            FramerState::Version1 => {
                if byte == VERSION[1] {
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = FramerState::Kind;
                    None
                } else {
                    self.resync(byte, FrameError::BadVersion { offset: 2, got: byte })
                }
            }
            FramerState::Kind => match PacketType::from_byte(byte) {
                Some(kind) => {
                    self.kind = kind;
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = FramerState::Id;
                    None
                }
                None => self.resync(byte, FrameError::BadPacketType { got: byte }),
            },
            FramerState::Id => {
                self.id = byte;
                self.sum = self.sum.wrapping_add(byte);
                self.state = FramerState::Size;
                None
            }
            FramerState::Size => {
                if byte == 0 || byte as usize > MAX_PAYLOAD {
                    self.resync(byte, FrameError::SizeOutOfRange { got: byte })
                } else {
                    self.size = byte;
                    self.sum = self.sum.wrapping_add(byte);
                    self.payload.clear();
                    self.state = FramerState::Payload;
                    None
                }
            }
            FramerState::Payload => {
                self.payload.push(byte);
                self.sum = self.sum.wrapping_add(byte);
                if self.payload.len() == self.size as usize {
                    self.state = FramerState::Checksum;
                }
                None
            }
            FramerState::Checksum => {
                let expected = self.sum;
                self.state = FramerState::Sync;
                self.desync_reported = false;
                if byte == expected {
                    Some(FramerEvent::Frame(Packet {
                        packet_type: self.kind,
                        id: self.id,
                        payload: std::mem::take(&mut self.payload),
                    }))
                } else {
                    self.payload.clear();
                    Some(FramerEvent::Error(FrameError::ChecksumMismatch {
                        expected,
                        got: byte,
                    }))
                }
            }
        }
    }

    fn begin_frame(&mut self) {
        self.state = FramerState::Version0;
        self.sum = 0;
        self.payload.clear();
        self.desync_reported = false;
    }

    /// Abandon the current frame and re-examine `byte` as a start marker.
    fn resync(&mut self, byte: u8, error: FrameError) -> Option<FramerEvent> {
        if byte == START_BYTE {
            self.begin_frame();
        } else {
            self.state = FramerState::Sync;
            self.desync_reported = true;
        }
        Some(FramerEvent::Error(error))
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
