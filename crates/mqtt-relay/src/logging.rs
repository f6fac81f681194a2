// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-relay leveled logging.
//!
//! Each relay formats its own lines (`[timestamp] [name] [LEVEL] message`)
//! and hands them to a [`LogSink`]. The default sink forwards to `tracing`.

use crate::config::LogOptions;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Relay log threshold.
///
/// Ordered from most to least verbose. `None` suppresses everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    None,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::None,
    ];

    /// Parse a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "none" => Some(LogLevel::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "none",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::None => "NONE",
        }
    }

    /// Comma-separated list of accepted names.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(LogLevel::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for formatted relay log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, level: LogLevel, relay: &str, line: &str);
}

/// Sink forwarding relay lines to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, level: LogLevel, relay: &str, line: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(relay = %relay, "{}", line),
            LogLevel::Info => tracing::info!(relay = %relay, "{}", line),
            LogLevel::Warn => tracing::warn!(relay = %relay, "{}", line),
            LogLevel::Error => tracing::error!(relay = %relay, "{}", line),
            LogLevel::None => {}
        }
    }
}

/// Sink keeping lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether any line at `level` contains `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, line)| *l == level && line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write(&self, level: LogLevel, _relay: &str, line: &str) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push((level, line.to_string()));
    }
}

/// Local wall-clock timestamp, `YYYY-MM-DD HH:MM:SS`.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Leveled logger owned by one relay instance.
#[derive(Clone)]
pub struct RelayLog {
    name: String,
    level: LogLevel,
    use_timestamp: bool,
    use_brackets: bool,
    sink: Arc<dyn LogSink>,
}

impl RelayLog {
    pub fn new(name: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            name: name.into(),
            level: LogLevel::default(),
            use_timestamp: true,
            use_brackets: true,
            sink,
        }
    }

    /// Apply name, threshold and formatting options.
    pub fn configure(&mut self, name: &str, level: LogLevel, options: &LogOptions) {
        self.name = name.to_string();
        self.level = level;
        self.use_timestamp = options.use_timestamp;
        self.use_brackets = options.use_brackets;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Whether a message at `level` passes the threshold.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::None && level >= self.level
    }

    pub fn log(&self, level: LogLevel, message: impl fmt::Display) {
        if !self.enabled(level) {
            return;
        }
        let line = self.format_line(level, &message);
        self.sink.write(level, &self.name, &line);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, message);
    }

    fn format_line(&self, level: LogLevel, message: &dyn fmt::Display) -> String {
        let mut line = String::new();
        if self.use_timestamp {
            line.push_str(&self.wrap(&local_timestamp()));
            line.push(' ');
        }
        if self.use_brackets {
            line.push_str(&format!("[{}] [{}] {}", self.name, level.label(), message));
        } else {
            line.push_str(&format!("{} {}: {}", self.name, level.label(), message));
        }
        line
    }

    fn wrap(&self, text: &str) -> String {
        if self.use_brackets {
            format!("[{}]", text)
        } else {
            text.to_string()
        }
    }
}

impl fmt::Debug for RelayLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayLog")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("use_timestamp", &self.use_timestamp)
            .field("use_brackets", &self.use_brackets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_options() -> LogOptions {
        LogOptions {
            use_timestamp: false,
            ..LogOptions::default()
        }
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" warn "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("none"), Some(LogLevel::None));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::valid_names(), "debug, info, warn, error, none");
    }

    #[test]
    fn test_threshold() {
        let sink = Arc::new(MemorySink::new());
        let mut log = RelayLog::new("r1", sink.clone());
        log.configure("r1", LogLevel::Warn, &plain_options());

        log.info("hidden");
        log.warn("shown");
        log.error("also shown");

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (LogLevel::Warn, "[r1] [WARN] shown".to_string()));
    }

    #[test]
    fn test_level_none_silences() {
        let sink = Arc::new(MemorySink::new());
        let mut log = RelayLog::new("r1", sink.clone());
        log.set_level(LogLevel::None);
        log.error("nothing");
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_unbracketed_format() {
        let sink = Arc::new(MemorySink::new());
        let mut log = RelayLog::new("r1", sink.clone());
        let options = LogOptions {
            use_brackets: false,
            ..plain_options()
        };
        log.configure("edge", LogLevel::Debug, &options);
        log.debug("hello");
        assert!(sink.contains(LogLevel::Debug, "edge DEBUG: hello"));
    }

    #[test]
    fn test_timestamp_prefix() {
        let sink = Arc::new(MemorySink::new());
        let mut log = RelayLog::new("r1", sink.clone());
        log.configure("r1", LogLevel::Info, &LogOptions::default());
        log.info("stamped");
        let (_, line) = &sink.lines()[0];
        assert!(line.starts_with('['));
        assert!(line.ends_with("[r1] [INFO] stamped"));
    }
}
