//! Decoupled logging pipeline for the checkpointer.
//!
//! ```text
//! log::info!() / log_event!()
//!     |
//! [LogCollector] (non-blocking, crossbeam unbounded)
//!     |
//! [writer thread]
//!     +--> stderr                      (always)
//!     +--> <log_dir>/full/<ts>.log     (every line, when log_dir is set)
//!     +--> <log_dir>/events/<ts>.log   (target "events" only)
//! ```
//!
//! The reconcile loop never blocks on log I/O. The writer is a plain OS thread
//! so it keeps draining regardless of the tokio runtime state, and
//! [`LogCollector::wait_for_empty`] gives shutdown a way to make sure the final
//! lines reached disk.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Target used for per-tick summaries and lifecycle events.
pub const EVENTS_TARGET: &str = "events";

enum LogMessage {
    Line(LogLine),
    /// Flush marker; the sender is signalled once every earlier line is written.
    Flush(std::sync::mpsc::Sender<()>),
}

/// A log line with metadata.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    /// "full" or "events"
    pub log_type: String,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            log_type: "full".to_string(),
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        }
    }

    pub fn event(message: String) -> Self {
        LogLine {
            log_type: EVENTS_TARGET.to_string(),
            ..LogLine::new(message)
        }
    }

    fn formatted(&self) -> String {
        format!("[{}] {}\n", self.timestamp, self.message)
    }
}

fn open_log_file(dir: &Path, kind: &str) -> Option<File> {
    let path = dir.join(format!("{}_{}.log", Local::now().format("%Y%m%d_%H%M%S"), kind));
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("[Log] Failed to open {}: {}", path.display(), e);
            None
        }
    }
}

/// Logger handing lines to a background writer thread.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_dir: Option<PathBuf>,
    level: LevelFilter,
}

impl LogCollector {
    /// Start the writer thread. With `log_dir` unset only stderr is written.
    pub fn new(log_dir: Option<PathBuf>, level: LevelFilter) -> Result<Self, String> {
        let mut full_file = None;
        let mut events_file = None;
        if let Some(dir) = &log_dir {
            let full_dir = dir.join("full");
            let events_dir = dir.join(EVENTS_TARGET);
            std::fs::create_dir_all(&full_dir)
                .map_err(|e| format!("Failed to create full log dir: {}", e))?;
            std::fs::create_dir_all(&events_dir)
                .map_err(|e| format!("Failed to create events log dir: {}", e))?;
            full_file = open_log_file(&full_dir, "full");
            events_file = open_log_file(&events_dir, EVENTS_TARGET);
        }

        let (tx, rx) = unbounded::<LogMessage>();

        std::thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                let stderr = std::io::stderr();
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            let formatted = line.formatted();
                            let _ = stderr.lock().write_all(formatted.as_bytes());
                            if let Some(file) = full_file.as_mut() {
                                let _ = file.write_all(formatted.as_bytes());
                            }
                            if line.log_type == EVENTS_TARGET {
                                if let Some(file) = events_file.as_mut() {
                                    let _ = file.write_all(formatted.as_bytes());
                                }
                            }
                        }
                        LogMessage::Flush(done) => {
                            let _ = stderr.lock().flush();
                            for file in full_file.iter_mut().chain(events_file.iter_mut()) {
                                let _ = file.flush();
                                let _ = file.sync_data();
                            }
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| format!("Failed to spawn log writer: {}", e))?;

        Ok(LogCollector { tx, log_dir, level })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Queue a line. Never blocks.
    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Wait until every line queued before this call has been written.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(done_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        tokio::task::spawn_blocking(move || done_rx.recv())
            .await
            .map_err(|e| format!("Flush task failed: {}", e))?
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }

    /// Register a clone as the global `log` backend.
    pub fn install(&self) -> Result<(), log::SetLoggerError> {
        log::set_boxed_logger(Box::new(self.clone()))?;
        log::set_max_level(self.level);
        Ok(())
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());
        if record.target() == EVENTS_TARGET {
            self.log_line(LogLine::event(message));
        } else {
            self.log_line(LogLine::new(message));
        }
    }

    fn flush(&self) {}
}
