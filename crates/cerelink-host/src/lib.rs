//! Cerelink Host - driver for the stimulator serial link
//!
//! This crate implements the host side of the Cerelink session: it opens a
//! serial port, reassembles frames, dispatches inbound packets to
//! registered listeners, correlates command replies by sequence id, keeps
//! the session alive with a watchdog, recovers from link loss, and runs the
//! streaming/therapy control loop on top of a spectral seizure classifier.
//!
//! # Modules
//!
//! - [`link`]: Serial-port abstraction, `serialport` adapter, simulated device
//! - [`dispatch`]: Inbound packet queue and ordered listener table
//! - [`transport`]: Synchronous command/reply primitive
//! - [`connection`]: Session lifecycle and event bus
//! - [`watchdog`]: Periodic liveness ping and recovery trigger
//! - [`reconnect`]: Handshake retry loop after link loss
//! - [`streaming`]: Stream activation, sample fan-out, CSV logging
//! - [`therapy`]: Sliding-window monitor and therapy command workers
//! - [`processing`]: Spectral seizure classifier
//!
//! # Example
//!
//! ```rust,ignore
//! use cerelink_host::{config::LinkConfig, connection::Connection};
//!
//! let mut session = Connection::new(LinkConfig::default());
//! let mut events = session.subscribe();
//! session.open("/dev/ttyACM0").await;
//! session.start_streaming().await;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod link;
pub mod processing;
pub mod reconnect;
pub mod streaming;
pub mod therapy;
pub mod transport;
pub mod watchdog;

// Re-export key types
pub use config::LinkConfig;
pub use connection::{Connection, StatsSnapshot};
pub use events::DeviceEvent;
pub use processing::classify;
