//! Result records returned across the supervisor's public boundary.
//!
//! Supervisor operations are written internally as `Result<_, WardenError>`
//! and converted exactly once into a [`Report`], so nothing a caller invokes
//! can fail past its own boundary.

use crate::error::{ErrorCode, WardenError};
use crate::supervisor::SupervisorState;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Outcome of a mutating supervisor operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Whether the operation did what was asked
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Failure kind, present only when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    /// PID of the server process, when relevant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// The command that was sent, for `send_command`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Number of processes a termination request was delivered to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killed_count: Option<usize>,
}

impl Report {
    /// A successful outcome.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            pid: None,
            command: None,
            killed_count: None,
        }
    }

    /// A failed outcome built from the error that caused it.
    pub fn failed(err: &WardenError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            error: Some(err.code()),
            pid: None,
            command: None,
            killed_count: None,
        }
    }

    /// Attach a PID.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attach the command text.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Attach a kill count.
    pub fn with_killed_count(mut self, count: usize) -> Self {
        self.killed_count = Some(count);
        self
    }
}

impl From<WardenError> for Report {
    fn from(err: WardenError) -> Self {
        Self::failed(&err)
    }
}

impl From<crate::Result<Report>> for Report {
    fn from(result: crate::Result<Report>) -> Self {
        result.unwrap_or_else(Report::from)
    }
}

/// Snapshot returned by `status()`.
///
/// `memory_usage_mb` and `cpu_percent` are best-effort and read as zero when
/// the host does not expose process metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
    pub uptime_secs: u64,
    pub memory_usage_mb: f64,
    pub cpu_percent: f32,
}

impl StatusReport {
    pub(crate) fn stopped(state: SupervisorState) -> Self {
        Self {
            running: false,
            state,
            pid: None,
            started_at: None,
            uptime_secs: 0,
            memory_usage_mb: 0.0,
            cpu_percent: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_report_carries_code() {
        let report = Report::from(WardenError::NotRunning);
        assert!(!report.success);
        assert_eq!(report.error, Some(ErrorCode::NotRunning));
        assert!(report.message.contains("not running"));
    }

    #[test]
    fn test_optional_fields_are_skipped() {
        let report = Report::ok("Command 'list' sent").with_command("list");
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["command"], "list");
        assert!(json.get("pid").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("killed_count").is_none());
    }

    #[test]
    fn test_result_conversion() {
        let ok: crate::Result<Report> = Ok(Report::ok("fine").with_pid(7));
        assert_eq!(Report::from(ok).pid, Some(7));

        let err: crate::Result<Report> = Err(WardenError::AlreadyRunning);
        let report = Report::from(err);
        assert!(!report.success);
        assert_eq!(report.error, Some(ErrorCode::AlreadyRunning));
    }
}
