//! Cerelink operator console
//!
//! Interactive front end for the host driver: pick a serial port (or run
//! against the simulated device), watch the session's events scroll by,
//! and drive it from the keyboard.
//!
//! # Usage
//!
//! ```bash
//! # Connect to hardware, prompting for a port when several exist
//! cerelink
//!
//! # Connect to a specific port
//! cerelink run --port /dev/ttyACM0
//!
//! # No hardware needed
//! cerelink run --simulate
//!
//! # List candidate ports
//! cerelink devices
//! ```
//!
//! Keys while running: `s` toggles streaming, `t` toggles the therapy
//! switch, `q` or Esc quits.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossterm::event::{Event, KeyCode, KeyEventKind};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cerelink_core::types::{ConnectionStatus, StreamingStatus};
use cerelink_host::connection::Connection;
use cerelink_host::link::{available_ports, simulated::SimulatedDevice};
use cerelink_host::{DeviceEvent, LinkConfig};

/// Cerelink operator console
#[derive(Parser, Debug)]
#[command(name = "cerelink")]
#[command(author, version, about = "Cerelink neurostimulator console", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a device and run the interactive session (default)
    Run {
        /// Serial port path (e.g. /dev/ttyACM0 or COM4)
        #[arg(short, long)]
        port: Option<String>,

        /// Run against the in-process simulated device
        #[arg(long)]
        simulate: bool,

        /// Streaming CSV log path
        #[arg(long)]
        log_path: Option<PathBuf>,

        /// Start with the therapy switch enabled
        #[arg(long)]
        therapy: bool,
    },

    /// List available serial ports
    Devices,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Cerelink v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        None => run_session(None, false, None, false),
        Some(Commands::Run {
            port,
            simulate,
            log_path,
            therapy,
        }) => run_session(port, simulate, log_path, therapy),
        Some(Commands::Devices) => {
            list_devices();
            Ok(())
        }
    }
}

fn list_devices() {
    let ports = available_ports();
    if ports.is_empty() {
        info!("no serial ports found");
    } else {
        for port in ports {
            info!("  {port}");
        }
    }
}

/// Resolve which port to use: explicit flag, the only port present, or an
/// interactive pick.
fn select_port(requested: Option<String>) -> anyhow::Result<String> {
    if let Some(port) = requested {
        return Ok(port);
    }
    let ports = available_ports();
    match ports.len() {
        0 => bail!("no serial ports found; is the device plugged in?"),
        1 => Ok(ports.into_iter().next().expect("length checked")),
        _ => {
            println!("Several ports found:");
            for (index, port) in ports.iter().enumerate() {
                println!("  [{index}] {port}");
            }
            print!("Port number: ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            let index: usize = line
                .trim()
                .parse()
                .context("expected one of the listed numbers")?;
            ports
                .into_iter()
                .nth(index)
                .context("expected one of the listed numbers")
        }
    }
}

fn run_session(
    port: Option<String>,
    simulate: bool,
    log_path: Option<PathBuf>,
    therapy: bool,
) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_session_async(port, simulate, log_path, therapy))
}

async fn run_session_async(
    port: Option<String>,
    simulate: bool,
    log_path: Option<PathBuf>,
    therapy: bool,
) -> anyhow::Result<()> {
    let mut config = LinkConfig::default();
    if let Some(path) = log_path {
        config.stream_log_path = path;
    }

    let (mut session, port_name) = if simulate {
        info!("running against the simulated device");
        (
            Connection::with_link_factory(config, SimulatedDevice::factory()),
            "simulated".to_string(),
        )
    } else {
        (Connection::new(config), select_port(port)?)
    };

    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        let mut sample_count: u64 = 0;
        loop {
            match events.recv().await {
                Ok(event) => print_event(event, &mut sample_count),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!(port = %port_name, "connecting");
    match session.open(&port_name).await {
        ConnectionStatus::Connected => {}
        status => {
            printer.abort();
            bail!("could not connect: {status:?}");
        }
    }
    if therapy {
        session.set_therapy_enabled(true);
    }

    info!("keys: 's' toggle streaming, 't' toggle therapy, 'q' quit");
    let result = key_loop(&mut session, therapy).await;

    session.close().await;
    printer.abort();
    result
}

async fn key_loop(session: &mut Connection, therapy_enabled: bool) -> anyhow::Result<()> {
    crossterm::terminal::enable_raw_mode()?;
    let outcome = drive_keys(session, therapy_enabled).await;
    crossterm::terminal::disable_raw_mode()?;
    outcome
}

async fn drive_keys(session: &mut Connection, mut therapy_enabled: bool) -> anyhow::Result<()> {
    let mut streaming = false;
    loop {
        let key = tokio::task::spawn_blocking(|| -> anyhow::Result<Option<KeyCode>> {
            if crossterm::event::poll(Duration::from_millis(200))? {
                if let Event::Key(key) = crossterm::event::read()? {
                    if key.kind == KeyEventKind::Press {
                        return Ok(Some(key.code));
                    }
                }
            }
            Ok(None)
        })
        .await??;

        match key {
            Some(KeyCode::Char('q' | 'Q') | KeyCode::Esc) => return Ok(()),
            Some(KeyCode::Char('s' | 'S')) => {
                if streaming {
                    session.stop_streaming().await;
                    streaming = false;
                    info!("streaming stopped");
                } else {
                    match session.start_streaming().await {
                        StreamingStatus::Streaming | StreamingStatus::AlreadyStreaming => {
                            streaming = true;
                            info!("streaming started");
                        }
                        status => warn!(?status, "could not start streaming"),
                    }
                }
            }
            Some(KeyCode::Char('t' | 'T')) => {
                therapy_enabled = !therapy_enabled;
                session.set_therapy_enabled(therapy_enabled);
                info!(enabled = therapy_enabled, "therapy switch");
            }
            _ => {}
        }
    }
}

fn print_event(event: DeviceEvent, sample_count: &mut u64) {
    match event {
        DeviceEvent::Status(status) => info!(?status, "connection"),
        DeviceEvent::Sample(sample) => {
            *sample_count += 1;
            // One line per 250 samples is plenty at streaming rates.
            if *sample_count % 250 == 1 {
                info!(
                    total = *sample_count,
                    ts = sample.timestamp_ms,
                    mv = %format!("{:.2}", sample.voltage_mv),
                    "streaming"
                );
            }
        }
        DeviceEvent::Classification(c) => {
            if c.seizure {
                warn!(confidence = c.confidence, "seizure activity detected");
            }
        }
        DeviceEvent::TherapyRequired(required) => {
            if required {
                warn!("therapy required");
            } else {
                info!("therapy no longer required");
            }
        }
        DeviceEvent::TherapyEnabled(enabled) => info!(enabled, "therapy switch"),
    }
}
