//! Link recovery.
//!
//! The reconnect loop runs when the watchdog loses the device. It keeps
//! the dispatcher, every registered listener, and the streaming controller
//! alive; only the serial port, its reader thread, and the session status
//! are rebuilt. Once the handshake succeeds again, the `Connected` status
//! event tells the streaming controller to re-activate the stream.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cerelink_core::protocol::{DeviceError, OpCode};
use cerelink_core::types::ConnectionStatus;

use crate::connection::{sleep_cancellable, SessionInner};

/// Perform the session handshake: `InitialConnection`, retried within the
/// configured attempt budget.
///
/// `Ok` and `AlreadyConnected` replies both establish the session.
/// Timeouts and write failures are worth retrying after a short pause;
/// any other device error means retrying cannot help.
///
/// # Errors
///
/// The last device error when the budget runs out, or `Cancelled`.
pub(crate) async fn handshake(
    inner: &SessionInner,
    cancel: &CancellationToken,
) -> Result<(), DeviceError> {
    let mut last_error = DeviceError::TimeoutExpired;
    for attempt in 1..=inner.config.connection_attempts {
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        match inner
            .transport
            .send_command(OpCode::InitialConnection, &[])
            .await
        {
            Ok(()) | Err(DeviceError::AlreadyConnected) => return Ok(()),
            Err(error @ (DeviceError::TimeoutExpired | DeviceError::ComFailed)) => {
                debug!(%error, attempt, "handshake attempt failed");
                last_error = error;
                if !sleep_cancellable(inner.config.write_timeout, cancel).await {
                    return Err(DeviceError::Cancelled);
                }
            }
            Err(error) => return Err(error),
        }
    }
    Err(last_error)
}

/// Reconnect until the handshake succeeds or `cancel` fires.
///
/// Returns `true` once the session is re-established. Each pass announces
/// `Disconnected`, tries the handshake over the existing port, and only
/// tears the port down and reopens it when that fails. A port that cannot
/// be reopened announces `NoDevice` and is retried after a delay.
pub(crate) async fn run(inner: &SessionInner, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }

        inner.set_status(ConnectionStatus::Disconnected);

        match handshake(inner, cancel).await {
            Ok(()) => {
                info!(port = %inner.port_name, "link re-established");
                inner.set_status(ConnectionStatus::Connected);
                return true;
            }
            Err(DeviceError::Cancelled) => return false,
            Err(error) => {
                debug!(%error, "handshake still failing; rebuilding the port");
            }
        }

        // Tear down the dead port and its reader, keep everything else.
        inner.stop_reader().await;
        inner.transport.clear_writer().await;

        let link = match (inner.link_factory)(&inner.port_name, &inner.config) {
            Ok(link) => link,
            Err(error) => {
                warn!(%error, port = %inner.port_name, "port reopen failed");
                inner.set_status(ConnectionStatus::NoDevice);
                if !sleep_cancellable(inner.config.bad_port_retry_delay, cancel).await {
                    return false;
                }
                continue;
            }
        };
        match link.try_clone() {
            Ok(writer) => {
                inner.transport.set_writer(writer).await;
                inner.spawn_reader(link);
            }
            Err(error) => {
                warn!(%error, "could not clone reopened port");
                inner.set_status(ConnectionStatus::NoDevice);
                if !sleep_cancellable(inner.config.bad_port_retry_delay, cancel).await {
                    return false;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
