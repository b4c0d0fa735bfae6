use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// Severity of an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One buffered entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.at.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Activity logger handed to each importer component at construction.
///
/// Every entry goes to `tracing` at its level; a logger built with
/// [`ActivityLog::with_buffer`] also keeps the most recent entries in memory.
pub struct ActivityLog {
    buffer: Option<RwLock<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl ActivityLog {
    /// Create a tracing-only logger (no buffer).
    pub fn new() -> Self {
        Self {
            buffer: None,
            max_entries: 0,
        }
    }

    /// Create a logger that also keeps the last `max_entries` entries.
    pub fn with_buffer(max_entries: usize) -> Self {
        Self {
            buffer: Some(RwLock::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn log(&self, msg: impl Display) {
        self.log_at(LogLevel::Info, msg);
    }

    pub fn log_at(&self, level: LogLevel, msg: impl Display) {
        let message = msg.to_string();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        if let Some(ref buf) = self.buffer {
            if let Ok(mut entries) = buf.write() {
                entries.push_back(LogEntry {
                    at: Utc::now(),
                    level,
                    message,
                });
                while entries.len() > self.max_entries {
                    entries.pop_front();
                }
            }
        }
    }

    /// Snapshot of buffered entries, oldest first. Empty without a buffer.
    pub fn entries(&self) -> Vec<LogEntry> {
        match &self.buffer {
            Some(buf) => buf
                .read()
                .map(|b| b.iter().cloned().collect())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Whether any buffered entry at `level` mentions `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffers_entries_at_info() {
        let logger = ActivityLog::with_buffer(4);
        logger.log("hello world");
        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[0].message, "hello world");
    }

    #[test]
    fn buffer_keeps_most_recent() {
        let logger = ActivityLog::with_buffer(3);
        logger.log("a");
        logger.log("b");
        logger.log_at(LogLevel::Warn, "c");
        logger.log("d");
        let entries = logger.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "b");
        assert_eq!(entries[2].message, "d");
        assert!(logger.contains(LogLevel::Warn, "c"));
        assert!(!logger.contains(LogLevel::Info, "c"));
    }

    #[test]
    fn entries_empty_without_buffer() {
        let logger = ActivityLog::new();
        logger.log("test");
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn entry_display_is_timestamped() {
        let logger = ActivityLog::with_buffer(1);
        logger.log_at(LogLevel::Error, "boom");
        let line = logger.entries()[0].to_string();
        assert!(line.ends_with(" ERROR boom"), "unexpected: {line}");
        assert_eq!(&line[2..3], ":");
        assert_eq!(&line[5..6], ":");
    }
}
