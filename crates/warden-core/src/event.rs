//! Output events: one line of observed activity.

use chrono::{Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity/origin of an [`OutputEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// A line the server printed
    Output,
    /// A command sent to the server's stdin
    Command,
    Info,
    Success,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Command => "command",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Upper-case label used in the durable log.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Output => "OUTPUT",
            Self::Command => "COMMAND",
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable line of activity, stamped to the second.
///
/// Serializes as `{"timestamp": "HH:MM:SS", "message": ..., "level": ...}`,
/// the shape of the on-disk snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub timestamp: NaiveTime,
    pub message: String,
    pub level: EventLevel,
}

impl OutputEvent {
    /// Create an event stamped with the current local wall-clock second.
    pub fn now(level: EventLevel, message: impl Into<String>) -> Self {
        let now = Local::now().time();
        Self::at(now.with_nanosecond(0).unwrap_or(now), level, message)
    }

    pub fn at(timestamp: NaiveTime, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
            level,
        }
    }

    pub fn output(message: impl Into<String>) -> Self {
        Self::now(EventLevel::Output, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::now(EventLevel::Command, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::now(EventLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::now(EventLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::now(EventLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::now(EventLevel::Error, message)
    }

    /// Format as a durable log line: `[HH:MM:SS] [LEVEL] message`.
    pub fn log_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.level.label(),
            self.message
        )
    }
}
