//! Session event surface.
//!
//! Everything the driver reports to the outside world travels on one
//! broadcast bus owned by the session. Emission is fire-and-forget: a slow
//! or absent subscriber never blocks the emitter, and a lagging subscriber
//! loses old events rather than stalling the link.

use cerelink_core::types::{ConnectionStatus, SeizureClassification, StreamingSample};

/// Events broadcast by a [`crate::connection::Connection`].
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    /// The connection lifecycle state changed.
    Status(ConnectionStatus),
    /// A decoded neural-signal sample arrived.
    Sample(StreamingSample),
    /// The classifier evaluated a sample window.
    Classification(SeizureClassification),
    /// The hysteresis state machine changed its therapy decision.
    TherapyRequired(bool),
    /// The operator enabled or disabled therapy delivery.
    TherapyEnabled(bool),
}
