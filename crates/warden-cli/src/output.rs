//! Terminal output for the warden console.
//!
//! Colored status lines, key-value listings, confirmations, and rendering of
//! supervisor events and reports.

use anyhow::{Context, Result};
use console::style;
use dialoguer::Confirm;
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use warden_core::{EventLevel, OutputEvent, Report};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable formatted output
    Human,
    /// JSON output for scripting
    Json,
}

impl OutputFormat {
    pub fn from_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Human }
    }
}

/// Print a success message
pub fn success(msg: impl Display) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Print an error message
pub fn error(msg: impl Display) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

/// Print a warning message
pub fn warning(msg: impl Display) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

/// Print an info message
pub fn info(msg: impl Display) {
    println!("{} {}", style("ℹ").blue().bold(), msg);
}

/// Print a section header
pub fn header(msg: impl Display) {
    println!("\n{}", style(msg).bold().underlined());
}

/// Print a key-value pair
pub fn kv(key: impl Display, value: impl Display) {
    println!("  {}: {}", style(key).cyan(), value);
}

/// Prompt user for confirmation
pub fn confirm(msg: impl Into<String>) -> Result<bool> {
    Confirm::new()
        .with_prompt(msg)
        .default(false)
        .interact()
        .context("Failed to get user confirmation")
}

/// Print a supervisor report as a success or error line.
pub fn report(report: &Report) {
    if report.success {
        success(&report.message);
    } else {
        error(&report.message);
    }
}

/// Render one event the way the console shows it live.
pub fn event_line(event: &OutputEvent) -> String {
    let time = style(event.timestamp.format("%H:%M:%S")).dim();
    match event.level {
        EventLevel::Output => format!("{} {}", time, event.message),
        EventLevel::Command => format!("{} {} {}", time, style(">").magenta().bold(), event.message),
        EventLevel::Info => format!("{} {}", time, style(&event.message).blue()),
        EventLevel::Success => format!("{} {}", time, style(&event.message).green()),
        EventLevel::Warning => format!("{} {}", time, style(&event.message).yellow()),
        EventLevel::Error => format!("{} {}", time, style(&event.message).red().bold()),
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Output data in the specified format
pub fn output<T: Serialize>(data: &T, format: OutputFormat) -> Result<()> {
    let json = match format {
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
        OutputFormat::Human => serde_json::to_string(data)?,
    };
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }

    #[test]
    fn test_output_format() {
        assert_eq!(OutputFormat::from_flag(true), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flag(false), OutputFormat::Human);
    }

    #[test]
    fn test_event_line_keeps_message() {
        console::set_colors_enabled(false);
        let at = NaiveTime::from_hms_opt(8, 30, 0).unwrap();

        let line = event_line(&OutputEvent::at(at, EventLevel::Command, "say hi"));
        assert_eq!(line, "08:30:00 > say hi");

        let line = event_line(&OutputEvent::at(at, EventLevel::Output, "[Server thread/INFO]: Done"));
        assert_eq!(line, "08:30:00 [Server thread/INFO]: Done");
    }
}
