//! Session watchdog.
//!
//! Pings the device at a fixed interval. A tick that exhausts its retry
//! budget, or that sees an error meaning the session is gone, hands
//! control to the reconnect loop and resumes ticking once the link is
//! back. The tick loop is sequential, so a tick can never overlap an
//! in-progress recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cerelink_core::protocol::{DeviceError, OpCode};

use crate::connection::SessionInner;
use crate::reconnect;

/// Handle to the running watchdog task.
pub(crate) struct Watchdog {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Watchdog {
    /// Start the watchdog for an established session.
    pub(crate) fn spawn(inner: Arc<SessionInner>) -> Self {
        let cancel = inner.cancel.child_token();
        let task = tokio::spawn(run(inner, cancel.clone()));
        Self { cancel, task }
    }

    /// Stop the watchdog, waiting up to `join_timeout` for the task.
    pub(crate) async fn shutdown(self, join_timeout: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(join_timeout, self.task).await.is_err() {
            warn!("watchdog task did not stop in time; detaching");
        }
    }
}

async fn run(inner: Arc<SessionInner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(inner.config.feeding_interval) => {}
        }

        if !feed(&inner, &cancel).await {
            if cancel.is_cancelled() {
                break;
            }
            warn!("watchdog lost the device; starting recovery");
            // The tick timer is implicitly stopped while recovery runs:
            // this loop does nothing else until the reconnect returns.
            if !reconnect::run(&inner, &cancel).await {
                break;
            }
            debug!("watchdog resuming after reconnect");
        }
    }
}

/// One watchdog tick. Returns whether the device acknowledged a ping.
async fn feed(inner: &SessionInner, cancel: &CancellationToken) -> bool {
    for attempt in 1..=inner.config.watchdog_attempts {
        if cancel.is_cancelled() {
            return true;
        }
        match inner
            .transport
            .send_command(OpCode::WatchdogReset, &[])
            .await
        {
            Ok(()) => return true,
            // The session is gone outright; retrying the ping cannot help.
            Err(DeviceError::NotConnected | DeviceError::NotOpen) => {
                debug!("watchdog ping rejected: session is down");
                return false;
            }
            Err(error) => {
                debug!(%error, attempt, "watchdog ping failed");
            }
        }
    }
    false
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cerelink_core::protocol::{Packet, PacketType};

    use crate::config::LinkConfig;
    use crate::connection::test_session_inner;
    use crate::link::mock::MockLink;

    fn tick_config() -> LinkConfig {
        LinkConfig {
            write_timeout: Duration::from_millis(100),
            watchdog_attempts: 3,
            ..LinkConfig::default()
        }
    }

    fn reply_ok(packet: &Packet) -> Packet {
        Packet {
            packet_type: PacketType::Command,
            id: packet.id,
            payload: vec![0x00],
        }
    }

    fn reply_err(packet: &Packet, code: DeviceError) -> Packet {
        Packet {
            packet_type: PacketType::Error,
            id: packet.id,
            payload: vec![code.to_byte()],
        }
    }

    #[tokio::test]
    async fn test_tick_retries_within_budget() {
        let (link, handle) = MockLink::new();
        let mut rejections = 2;
        handle.respond_with(move |packet| {
            if rejections > 0 {
                rejections -= 1;
                vec![reply_err(packet, DeviceError::BadChecksum)]
            } else {
                vec![reply_ok(packet)]
            }
        });

        let inner = test_session_inner(tick_config(), Box::new(link)).await;
        let cancel = CancellationToken::new();

        assert!(feed(&inner, &cancel).await);
        assert_eq!(handle.written().len(), 3);
        inner.cancel.cancel();
    }

    #[tokio::test]
    async fn test_tick_gives_up_when_budget_exhausted() {
        let (link, handle) = MockLink::new();
        handle.respond_with(|packet| vec![reply_err(packet, DeviceError::BadChecksum)]);

        let inner = test_session_inner(tick_config(), Box::new(link)).await;
        let cancel = CancellationToken::new();

        assert!(!feed(&inner, &cancel).await);
        assert_eq!(handle.written().len(), 3);
        inner.cancel.cancel();
    }

    #[tokio::test]
    async fn test_session_loss_aborts_the_tick_immediately() {
        let (link, handle) = MockLink::new();
        handle.respond_with(|packet| vec![reply_err(packet, DeviceError::NotConnected)]);

        let inner = test_session_inner(tick_config(), Box::new(link)).await;
        let cancel = CancellationToken::new();

        // No point pinging a device that says the session is gone.
        assert!(!feed(&inner, &cancel).await);
        assert_eq!(handle.written().len(), 1);
        inner.cancel.cancel();
    }
}
