//! One-shot commands of the warden CLI.

use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_core::{system, LogCursor, OutputSink, PortResolver, ProcessSupervisor, SupervisorConfig};

/// Default config file name looked up in the current directory.
pub const LOCAL_CONFIG_FILE: &str = "warden.toml";

/// How long a terminated port owner gets to exit.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// The config file to use: explicit, then `./warden.toml`, then the user
/// config directory.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return local;
    }

    dirs::config_dir()
        .map(|dir| dir.join("warden").join("config.toml"))
        .unwrap_or(local)
}

pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    SupervisorConfig::load_from_path(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Print the probe of `port`, optionally terminating its owner.
pub async fn probe_port(config: &SupervisorConfig, port: u16, kill: bool, format: OutputFormat) -> Result<()> {
    let resolver = PortResolver::from_config(config);
    let probe = resolver.resolve(port).await;

    if format == OutputFormat::Json {
        output::output(&probe, format)?;
    } else {
        output::header(format!("Port {}", port));
        output::kv("In use", probe.in_use);
        output::kv(
            "Owner PID",
            probe
                .owner_pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        );
        if let Some(strategy) = &probe.detected_by {
            output::kv("Detected by", strategy);
        }
        if probe.inconclusive {
            output::warning("Every detection method failed; the port was assumed free");
        }
    }

    if !kill || !probe.in_use {
        return Ok(());
    }

    let Some(pid) = probe.owner_pid else {
        anyhow::bail!("Port {} is in use, but its owner could not be identified", port);
    };

    if !output::confirm(format!("Terminate process {} holding port {}?", pid, port))? {
        output::info("Left running");
        return Ok(());
    }

    if system::terminate_pid(pid, TERMINATE_TIMEOUT).await {
        output::success(format!("Process {} terminated", pid));
        Ok(())
    } else {
        anyhow::bail!("Process {} did not exit within {:?}", pid, TERMINATE_TIMEOUT)
    }
}

#[derive(Serialize)]
struct DrainedLines {
    lines: Vec<String>,
    cursor: LogCursor,
}

/// Print the last `lines` log lines, or everything after `since`.
pub fn show_logs(
    config: &SupervisorConfig,
    lines: Option<usize>,
    since: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let sink = OutputSink::open(config);

    match since {
        Some(offset) => {
            let (lines, cursor) = sink.drain_since(LogCursor(offset));
            if format == OutputFormat::Json {
                return output::output(&DrainedLines { lines, cursor }, format);
            }
            for line in &lines {
                println!("{}", line);
            }
            output::info(format!("Next cursor: {}", cursor.offset()));
        }
        None => {
            let lines = sink.tail(lines.unwrap_or(config.tail_lines));
            if format == OutputFormat::Json {
                return output::output(&lines, format);
            }
            if lines.is_empty() {
                output::info("No log entries yet");
            }
            for line in &lines {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

/// Terminate every process whose name contains `name`.
pub async fn kill_processes(config: &SupervisorConfig, name: &str, yes: bool, format: OutputFormat) -> Result<()> {
    let matches = system::processes_matching(name);
    if matches.is_empty() {
        output::info(format!("No process matches '{}'", name));
        return Ok(());
    }

    if format == OutputFormat::Human {
        output::header("Matching processes");
        for (pid, process_name) in &matches {
            output::kv(pid, process_name);
        }
    }

    if !yes && !output::confirm(format!("Terminate {} process(es)?", matches.len()))? {
        output::info("Nothing terminated");
        return Ok(());
    }

    let supervisor = ProcessSupervisor::new(config.clone());
    let report = supervisor.kill_all_matching(name).await;

    if format == OutputFormat::Json {
        output::output(&report, format)
    } else if report.success {
        output::report(&report);
        Ok(())
    } else {
        anyhow::bail!(report.message)
    }
}

/// Print the effective configuration, or write it to `path`.
pub fn show_config(config: &SupervisorConfig, path: &Path, write: bool, format: OutputFormat) -> Result<()> {
    if write {
        config
            .save_to_path(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        output::success(format!("Configuration written to {}", path.display()));
        return Ok(());
    }

    match format {
        OutputFormat::Json => output::output(config, format),
        OutputFormat::Human => {
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("# {}", path.display());
            print!("{}", rendered);
            Ok(())
        }
    }
}
