//! Serial-port abstraction.
//!
//! The driver talks to the device through the [`SerialLink`] trait so the
//! same session logic runs against real hardware (`serialport`), the
//! in-process [`simulated::SimulatedDevice`], and the byte-level mocks the
//! tests use. A link can be cloned into independent reader and writer
//! handles sharing one underlying port.

use std::io::{Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::config::LinkConfig;

pub mod simulated;

#[cfg(test)]
pub(crate) mod mock;

/// Errors from the serial layer.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Port enumeration, open, or configuration failed.
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),
    /// A read or write on an open port failed.
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The link has been shut down.
    #[error("link closed")]
    Closed,
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// A byte-oriented connection to the device.
pub trait SerialLink: Send {
    /// Read one byte, blocking up to the configured read timeout.
    ///
    /// Returns `Ok(None)` on timeout. Timeouts are routine: the device is
    /// silent between frames.
    fn read_byte(&mut self) -> LinkResult<Option<u8>>;

    /// Write all bytes of one frame.
    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()>;

    /// Clone a second handle to the same port.
    fn try_clone(&self) -> LinkResult<Box<dyn SerialLink>>;
}

/// Constructor for links, injectable so sessions can run against simulated
/// or mock ports.
pub type LinkFactory =
    Arc<dyn Fn(&str, &LinkConfig) -> LinkResult<Box<dyn SerialLink>> + Send + Sync>;

// ============================================================================
// serialport adapter
// ============================================================================

/// [`SerialLink`] over a real serial port.
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink for SerialPortLink {
    fn read_byte(&mut self) -> LinkResult<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn try_clone(&self) -> LinkResult<Box<dyn SerialLink>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(SerialPortLink { port }))
    }
}

/// Open a serial port with the session's configuration (8N1 framing).
///
/// # Errors
///
/// Returns an error if the port cannot be opened or configured.
pub fn open_port(name: &str, config: &LinkConfig) -> LinkResult<Box<dyn SerialLink>> {
    let port = serialport::new(name, config.baud_rate)
        .timeout(config.read_timeout)
        .open()?;
    Ok(Box::new(SerialPortLink { port }))
}

/// The default [`LinkFactory`], backed by [`open_port`].
#[must_use]
pub fn default_factory() -> LinkFactory {
    Arc::new(|name, config| open_port(name, config))
}

/// List the names of serial ports present on this machine.
#[must_use]
pub fn available_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}
