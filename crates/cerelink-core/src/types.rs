//! Shared data types for the stimulator link.
//!
//! Streaming samples, classification results, and the status enums the
//! session reports to its subscribers.

use serde::{Deserialize, Serialize};

// ============================================================================
// Sample Conversion
// ============================================================================

/// Full-scale voltage span of the device ADC in millivolts.
pub const DYNAMIC_RANGE_MV: f64 = 3932.0;

/// Voltage represented by a raw reading of zero, in millivolts.
pub const X_MIN_MV: f64 = -1885.003_295_898_437_3;

/// Samples per classifier window.
pub const WINDOW_LEN: usize = 178;

/// Spectral bins produced by the classifier (window bins 1..=44, DC skipped).
pub const SPECTRUM_BINS: usize = 44;

/// Convert a raw 16-bit device reading to millivolts.
#[must_use]
pub fn reading_to_millivolts(reading: u16) -> f64 {
    f64::from(reading) / 65536.0 * DYNAMIC_RANGE_MV + X_MIN_MV
}

/// Convert millivolts back to the nearest raw device reading.
///
/// Inverse of [`reading_to_millivolts`] for voltages within the device
/// range; out-of-range inputs clamp to the 16-bit extremes.
#[must_use]
pub fn millivolts_to_reading(millivolts: f64) -> u16 {
    let raw = (millivolts - X_MIN_MV) / DYNAMIC_RANGE_MV * 65536.0;
    raw.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

// ============================================================================
// Streaming Sample
// ============================================================================

/// One decoded neural-signal sample from the stream.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamingSample {
    /// Device timestamp in milliseconds
    pub timestamp_ms: u32,
    /// Electrode voltage in millivolts
    pub voltage_mv: f64,
}

impl StreamingSample {
    /// Decode a sample from a StreamData payload.
    ///
    /// The payload carries a little-endian `u32` timestamp followed by a
    /// little-endian `u16` raw reading; any further bytes are reserved.
    /// Returns `None` when fewer than 6 bytes are present.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < 6 {
            return None;
        }
        let timestamp_ms = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let reading = u16::from_le_bytes([payload[4], payload[5]]);
        Some(Self {
            timestamp_ms,
            voltage_mv: reading_to_millivolts(reading),
        })
    }

    /// Encode the sample as a StreamData payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        payload.extend_from_slice(&millivolts_to_reading(self.voltage_mv).to_le_bytes());
        payload
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Output of the seizure classifier for one sample window.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SeizureClassification {
    /// `true` when the window is classified as seizure activity
    pub seizure: bool,
    /// Distance from the decision boundary (always non-negative)
    pub confidence: f32,
    /// Magnitude spectrum of the window, bins 1..=44
    pub spectrum: [f64; SPECTRUM_BINS],
}

// ============================================================================
// Session Status
// ============================================================================

/// Connection lifecycle states reported on the session event bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Never opened
    Unopened,
    /// Handshake complete, link healthy
    Connected,
    /// Open requested while a session was already established
    AlreadyConnected,
    /// No serial port could be opened
    NoDevice,
    /// Link lost; recovery in progress
    Disconnected,
    /// Session closed by the host
    Closed,
    /// Handshake failed
    Failed,
}

/// Result of a streaming start request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingStatus {
    /// Streaming is not active
    NotStreaming,
    /// Streaming was started
    Streaming,
    /// Streaming was already active
    AlreadyStreaming,
    /// The session is not connected
    ConnectionNotOpen,
}

// ============================================================================
// Tests
// ============================================================================
