//! Log channel between the traffic worker and the UI
//!
//! The worker thread and the controller push entries through a [`LogSink`]
//! without ever blocking; the UI drains them from a [`LogFeed`] inside its
//! async event loop. Every entry is also emitted as a `tracing` event so the
//! log file sees everything the pane shows.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

/// Default number of entries buffered between worker and UI
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Severity of a log pane entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.pad(label)
    }
}

/// One line of the log pane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            message: message.into(),
        }
    }
}

/// Producer side, cloned into the worker thread
#[derive(Clone)]
pub struct LogSink {
    tx: Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl LogSink {
    /// Append an entry
    ///
    /// Never blocks. When the UI has fallen behind the entry is dropped from
    /// the pane (it still reaches the tracing subscriber) and `false` is
    /// returned.
    pub fn push(&self, level: LogLevel, message: impl Into<String>) -> bool {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(target: "usb_traffic", "{}", message),
            LogLevel::Info => info!(target: "usb_traffic", "{}", message),
            LogLevel::Warn => warn!(target: "usb_traffic", "{}", message),
            LogLevel::Error => error!(target: "usb_traffic", "{}", message),
        }

        match self.tx.try_send(LogEntry::new(level, message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            // Nobody is watching the pane any more
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn debug(&self, message: impl Into<String>) -> bool {
        self.push(LogLevel::Debug, message)
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.push(LogLevel::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) -> bool {
        self.push(LogLevel::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.push(LogLevel::Error, message)
    }

    /// Number of entries dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side, owned by the UI
pub struct LogFeed {
    rx: Receiver<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl LogFeed {
    /// Wait for the next entry
    pub async fn recv(&self) -> crate::Result<LogEntry> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take the next entry if one is queued
    pub fn try_recv(&self) -> Option<LogEntry> {
        match self.rx.try_recv() {
            Ok(entry) => Some(entry),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Take every queued entry
    pub fn drain(&self) -> Vec<LogEntry> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Number of entries producers had to drop
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create the log channel
///
/// Returns (LogSink for producers, LogFeed for the UI)
pub fn create_log_channel(capacity: usize) -> (LogSink, LogFeed) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    (
        LogSink {
            tx,
            dropped: dropped.clone(),
        },
        LogFeed { rx, dropped },
    )
}
