//! Framing error types.
//!
//! Errors here describe malformed byte streams seen by the frame parser.
//! They carry the offending bytes so the host can log something actionable
//! without keeping its own copy of the input.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while reassembling frames from the serial byte stream.
///
/// None of these are fatal: the parser discards the offending bytes and
/// resynchronizes on the next start marker. The host logs them and keeps
/// reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FrameError {
    /// Bytes arrived while waiting for the 0xAA start marker.
    ///
    /// Reported once per desync episode, not once per byte.
    #[error("stream out of sync: got 0x{got:02X} while expecting start marker")]
    Desync {
        /// First unexpected byte of the episode.
        got: u8,
    },

    /// A protocol version byte did not match.
    #[error("bad version byte at offset {offset}: got 0x{got:02X}")]
    BadVersion {
        /// Frame offset of the mismatch (1 or 2).
        offset: u8,
        /// The byte that was read.
        got: u8,
    },

    /// The type byte is outside the known packet-type set.
    #[error("bad packet type: 0x{got:02X}")]
    BadPacketType {
        /// The byte that was read.
        got: u8,
    },

    /// The size byte is outside the allowed 1..=254 range.
    #[error("payload size {got} out of range (1..=254)")]
    SizeOutOfRange {
        /// The size byte that was read.
        got: u8,
    },

    /// The trailing checksum did not match the running sum.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{got:02X}")]
    ChecksumMismatch {
        /// Checksum computed over the received frame.
        expected: u8,
        /// Checksum byte on the wire.
        got: u8,
    },
}
