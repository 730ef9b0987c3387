//! The `warden run` console.
//!
//! Streams server activity to the terminal and forwards typed lines to the
//! server's stdin. Lines starting with `:` are console commands.

use crate::commands::TERMINATE_TIMEOUT;
use crate::output;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use warden_core::{system, PortResolver, ProcessSupervisor, SupervisorConfig};

const HELP: &str = "\
Anything not starting with ':' is sent to the server.
  :status          show server status
  :start           start the server
  :stop            stop the server
  :restart         restart the server
  :logs [n]        show the last n log lines
  :drain           show and clear queued events
  :kill <name>     terminate every process whose name contains <name>
  :help            show this help
  :quit            stop the server and exit";

/// One line typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(String),
    Status,
    Start,
    Stop,
    Restart,
    Logs(Option<usize>),
    Drain,
    Kill(String),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl ConsoleInput {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        let Some(directive) = line.strip_prefix(':') else {
            return Self::Command(line.to_string());
        };

        let mut parts = directive.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match (name, rest.as_slice()) {
            ("status", []) => Self::Status,
            ("start", []) => Self::Start,
            ("stop", []) => Self::Stop,
            ("restart", []) => Self::Restart,
            ("logs", []) => Self::Logs(None),
            ("logs", [n]) => match n.parse() {
                Ok(n) => Self::Logs(Some(n)),
                Err(_) => Self::Unknown(line.to_string()),
            },
            ("drain", []) => Self::Drain,
            ("kill", [target]) => Self::Kill(target.to_string()),
            ("help" | "h" | "?", []) => Self::Help,
            ("quit" | "q" | "exit", []) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

/// Run the console until `:quit`, end of input or Ctrl-C.
pub async fn run_console(config: SupervisorConfig, no_start: bool, reclaim: bool) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

    claim_console_port(&config, reclaim).await?;
    let _instance = hold_console_port(config.console_port).await;

    let supervisor = Arc::new(ProcessSupervisor::new(config.clone()));

    output::header("Warden");
    output::kv("Data directory", config.data_dir.display());
    output::kv("Server port", config.server_port);
    output::kv("Launch pattern", &config.launch_pattern);
    output::info("Type :help for console commands");

    let printer = spawn_printer(&supervisor);

    if !no_start {
        output::report(&supervisor.start().await);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read console input");
                        break;
                    }
                };
                if !handle_input(&supervisor, ConsoleInput::parse(&line)).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                output::warning("Interrupted");
                break;
            }
        }
    }

    if supervisor.is_running() {
        output::info("Stopping server...");
        output::report(&supervisor.stop().await);
    }

    // Let the last events reach the terminal
    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.abort();
    Ok(())
}

/// Returns `false` when the console should exit.
async fn handle_input(supervisor: &ProcessSupervisor, input: ConsoleInput) -> bool {
    match input {
        ConsoleInput::Empty => {}
        ConsoleInput::Command(command) => {
            let report = supervisor.send_command(&command).await;
            if !report.success {
                output::report(&report);
            }
        }
        ConsoleInput::Status => print_status(supervisor),
        ConsoleInput::Start => output::report(&supervisor.start().await),
        ConsoleInput::Stop => output::report(&supervisor.stop().await),
        ConsoleInput::Restart => output::report(&supervisor.restart().await),
        ConsoleInput::Logs(n) => {
            for line in supervisor.tail(n) {
                println!("{}", line);
            }
        }
        ConsoleInput::Drain => {
            let events = supervisor.queue().drain();
            output::info(format!("{} queued event(s)", events.len()));
            for event in &events {
                println!("{}", output::event_line(event));
            }
        }
        ConsoleInput::Kill(name) => {
            match output::confirm(format!("Terminate every process matching '{}'?", name)) {
                Ok(true) => output::report(&supervisor.kill_all_matching(&name).await),
                Ok(false) => output::info("Nothing terminated"),
                Err(e) => output::error(format!("{:#}", e)),
            }
        }
        ConsoleInput::Help => println!("{}", HELP),
        ConsoleInput::Quit => return false,
        ConsoleInput::Unknown(line) => output::warning(format!("Unknown console command: {}", line)),
    }
    true
}

fn print_status(supervisor: &ProcessSupervisor) {
    let status = supervisor.status();
    output::header("Server status");
    output::kv("State", status.state);
    if let Some(pid) = status.pid {
        output::kv("PID", pid);
        output::kv("Uptime", output::format_duration(Duration::from_secs(status.uptime_secs)));
        output::kv("Memory", format!("{:.1} MB", status.memory_usage_mb));
        output::kv("CPU", format!("{:.1}%", status.cpu_percent));
    }
}

fn spawn_printer(supervisor: &ProcessSupervisor) -> tokio::task::JoinHandle<()> {
    let mut events = supervisor.sink().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", output::event_line(&event)),
                Err(RecvError::Lagged(missed)) => {
                    output::warning(format!("{} event(s) skipped; use :logs to catch up", missed));
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Make sure no other instance holds the console port, offering to
/// terminate a stale one.
async fn claim_console_port(config: &SupervisorConfig, reclaim: bool) -> Result<()> {
    let port = config.console_port;
    let probe = PortResolver::from_config(config).resolve(port).await;

    if probe.inconclusive {
        output::warning(format!("Could not check whether port {} is free", port));
        return Ok(());
    }
    if !probe.in_use {
        return Ok(());
    }

    output::warning(format!("Console port {} is already in use", port));
    let Some(pid) = probe.owner_pid else {
        anyhow::bail!(
            "Port {} is held by an unidentified process; free it or change console_port",
            port
        );
    };
    output::kv("PID", pid);

    let terminate = reclaim || output::confirm(format!("Terminate process {}?", pid))?;
    if !terminate {
        anyhow::bail!("Console port {} is in use by PID {}", port, pid);
    }

    if !system::terminate_pid(pid, TERMINATE_TIMEOUT).await {
        anyhow::bail!("Process {} did not exit within {:?}", pid, TERMINATE_TIMEOUT);
    }
    output::success(format!("Process {} terminated", pid));

    // Give the OS a moment to release the socket
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// Bind the console port so other instances can detect this one.
async fn hold_console_port(port: u16) -> Option<tokio::task::JoinHandle<()>> {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "Could not bind console port");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        // Accept and drop so probes never fill the backlog
        while let Ok((_, peer)) = listener.accept().await {
            debug!(%peer, "Console port probed");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_are_commands() {
        assert_eq!(ConsoleInput::parse("say hi"), ConsoleInput::Command("say hi".to_string()));
        assert_eq!(ConsoleInput::parse("  list \n"), ConsoleInput::Command("list".to_string()));
        assert_eq!(ConsoleInput::parse("   "), ConsoleInput::Empty);
    }

    #[test]
    fn test_console_directives() {
        assert_eq!(ConsoleInput::parse(":status"), ConsoleInput::Status);
        assert_eq!(ConsoleInput::parse(":restart"), ConsoleInput::Restart);
        assert_eq!(ConsoleInput::parse(":logs"), ConsoleInput::Logs(None));
        assert_eq!(ConsoleInput::parse(":logs 20"), ConsoleInput::Logs(Some(20)));
        assert_eq!(ConsoleInput::parse(":kill java"), ConsoleInput::Kill("java".to_string()));
        assert_eq!(ConsoleInput::parse(":q"), ConsoleInput::Quit);
    }

    #[test]
    fn test_malformed_directives() {
        assert!(matches!(ConsoleInput::parse(":logs many"), ConsoleInput::Unknown(_)));
        assert!(matches!(ConsoleInput::parse(":kill"), ConsoleInput::Unknown(_)));
        assert!(matches!(ConsoleInput::parse(":frobnicate"), ConsoleInput::Unknown(_)));
    }
}
