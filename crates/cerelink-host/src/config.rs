//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Tunable parameters for a session.
///
/// The defaults match the device firmware's expectations; tests shrink the
/// timeouts to keep the suite fast.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Serial baud rate (8N1 framing is fixed).
    pub baud_rate: u32,

    /// Serial read timeout for the byte reader.
    pub read_timeout: Duration,

    /// How long a command waits for its matching reply.
    pub write_timeout: Duration,

    /// Handshake attempts before `open` gives up.
    pub connection_attempts: u32,

    /// Interval between watchdog pings.
    pub feeding_interval: Duration,

    /// Ping attempts per watchdog tick before recovery starts.
    pub watchdog_attempts: u32,

    /// Delay before retrying after the port could not be reopened.
    pub bad_port_retry_delay: Duration,

    /// Delay between stream-activation retries.
    pub stream_retry_delay: Duration,

    /// Stream-deactivation attempts when streaming shuts down.
    pub stream_cancel_attempts: u32,

    /// Delay between therapy command retries.
    pub therapy_retry_delay: Duration,

    /// Capacity of the inbound packet queue.
    pub queue_capacity: usize,

    /// How long `close` waits for each worker before detaching it.
    pub shutdown_join_timeout: Duration,

    /// Base path of the streaming CSV log. An existing file at this path is
    /// never overwritten; a numbered sibling is created instead.
    pub stream_log_path: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            connection_attempts: 5,
            feeding_interval: Duration::from_millis(3000),
            watchdog_attempts: 3,
            bad_port_retry_delay: Duration::from_millis(3000),
            stream_retry_delay: Duration::from_millis(500),
            stream_cancel_attempts: 3,
            therapy_retry_delay: Duration::from_millis(50),
            queue_capacity: 256,
            shutdown_join_timeout: Duration::from_secs(1),
            stream_log_path: PathBuf::from("cerelink-stream.csv"),
        }
    }
}
