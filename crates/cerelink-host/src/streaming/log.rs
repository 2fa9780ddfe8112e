//! Streaming sample log.
//!
//! Samples are appended to a CSV file by a dedicated writer thread fed
//! through an unbounded queue, so disk latency never backs up into the
//! sample path. The configured filename is never overwritten: collisions
//! get a numbered sibling.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use tracing::warn;

use crate::connection::join_thread_bounded;

/// One CSV row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogRecord {
    pub timestamp_ms: u32,
    pub voltage_mv: f64,
    pub in_seizure: bool,
    pub therapy_required: bool,
}

/// Handle to the log writer thread.
pub(crate) struct SampleLog {
    tx: Option<mpsc::Sender<LogRecord>>,
    thread: Option<std::thread::JoinHandle<()>>,
    path: PathBuf,
}

impl SampleLog {
    /// Open the log file and start the writer thread.
    pub(crate) fn create(base_path: &Path) -> std::io::Result<Self> {
        let path = unique_path(base_path);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "'Timestamp','Value','InSeizure','TherapyState'")?;

        let (tx, rx) = mpsc::channel::<LogRecord>();
        let thread = std::thread::Builder::new()
            .name("cerelink-log".into())
            .spawn(move || {
                // Runs until every sender is dropped.
                for record in rx {
                    let line = format!(
                        "{},{},{},{}",
                        record.timestamp_ms,
                        record.voltage_mv,
                        record.in_seizure,
                        record.therapy_required
                    );
                    if writeln!(writer, "{line}").is_err() {
                        warn!("stream log write failed; dropping log output");
                        break;
                    }
                }
                let _ = writer.flush();
            })?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            path,
        })
    }

    /// Producer handle for the sample path. Sends never block.
    pub(crate) fn sender(&self) -> mpsc::Sender<LogRecord> {
        self.tx
            .as_ref()
            .cloned()
            .unwrap_or_else(|| mpsc::channel().0)
    }

    /// Path actually used, after collision renaming.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the writer, flushing what it has.
    ///
    /// Completes once every outstanding sender clone has been dropped and
    /// the thread drained the queue, or the join bound expires.
    pub(crate) async fn close(mut self, join_timeout: Duration) {
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            join_thread_bounded(thread, join_timeout, "cerelink-log").await;
        }
    }
}

/// Pick a filename that does not collide with an existing file.
fn unique_path(base: &Path) -> PathBuf {
    if !base.exists() {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stream".to_string());
    let extension = base.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = base.parent().unwrap_or_else(|| Path::new("."));

    for n in 1u32.. {
        let name = match &extension {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("ran out of filename candidates")
}

// ============================================================================
// Tests
// ============================================================================
