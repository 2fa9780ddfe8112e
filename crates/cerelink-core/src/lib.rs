//! Cerelink Core - wire protocol and shared types
//!
//! This crate provides the protocol definitions shared between the host
//! driver and anything that needs to speak the stimulator's serial framing:
//! the packet model, the byte-at-a-time frame parser, and the data types
//! carried over the link.
//!
//! # Modules
//!
//! - [`protocol`]: Frame layout, checksums, packet/opcode/error codes, and
//!   the reentrant [`protocol::Framer`] state machine
//! - [`types`]: Streaming samples, classification results, and session
//!   status enums
//! - [`error`]: Framing error types
//!
//! # Example
//!
//! ```rust
//! use cerelink_core::protocol::{Framer, FramerEvent, OpCode, Packet, PacketType};
//!
//! // Encode a watchdog ping and feed it back through the parser.
//! let packet = Packet::command(7, OpCode::WatchdogReset, &[]);
//! let frame = packet.to_frame();
//!
//! let mut framer = Framer::new();
//! let mut decoded = None;
//! for byte in frame {
//!     if let Some(FramerEvent::Frame(p)) = framer.push(byte) {
//!         decoded = Some(p);
//!     }
//! }
//! assert_eq!(decoded.unwrap().packet_type, PacketType::Command);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use error::FrameError;
pub use protocol::{DeviceError, Framer, FramerEvent, OpCode, Packet, PacketType};
pub use types::{
    ConnectionStatus, SeizureClassification, StreamingSample, StreamingStatus, SPECTRUM_BINS,
    WINDOW_LEN,
};
