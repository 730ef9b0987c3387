//! Owner lookups, tried once a port is known to be bound.

use super::{line_mentions_port, run_tool};
use crate::system;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::time::Duration;

static SS_PID: Lazy<Regex> = Lazy::new(|| Regex::new(r"pid=(\d+)").expect("valid regex"));

/// One way of finding which process holds a port.
///
/// `Ok(None)` and `Err` both mean "try the next lookup"; the distinction is
/// only kept for diagnostics.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, port: u16) -> io::Result<Option<u32>>;
}

/// `lsof -t -iTCP:<port> -sTCP:LISTEN`
#[derive(Debug, Clone)]
pub struct LsofOwner {
    timeout: Duration,
}

impl LsofOwner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl OwnerLookup for LsofOwner {
    fn name(&self) -> &'static str {
        "lsof"
    }

    async fn lookup(&self, port: u16) -> io::Result<Option<u32>> {
        let selector = format!("-iTCP:{}", port);
        let output = run_tool("lsof", &["-t", &selector, "-sTCP:LISTEN"], self.timeout).await?;
        Ok(parse_lsof_pids(&output))
    }
}

/// Any other process whose name contains one of the hints, reported only
/// for the one port that program is known to bind.
///
/// A heuristic: it finds a stale instance of a known program, not the
/// actual socket owner.
#[derive(Debug, Clone)]
pub struct NameHintOwner {
    hints: Vec<String>,
    port: u16,
}

impl NameHintOwner {
    pub fn new(hints: Vec<String>, port: u16) -> Self {
        Self {
            hints: hints
                .into_iter()
                .map(|h| h.to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            port,
        }
    }

    /// Hint with the name of the running executable.
    pub fn current_program(port: u16) -> Self {
        Self::new(system::current_program_name().into_iter().collect(), port)
    }
}

#[async_trait]
impl OwnerLookup for NameHintOwner {
    fn name(&self) -> &'static str {
        "name-hint"
    }

    async fn lookup(&self, port: u16) -> io::Result<Option<u32>> {
        if port != self.port || self.hints.is_empty() {
            return Ok(None);
        }

        let hints = self.hints.clone();
        tokio::task::spawn_blocking(move || {
            hints
                .iter()
                .flat_map(|hint| system::processes_matching(hint))
                .map(|(pid, _)| pid)
                .min()
        })
        .await
        .map_err(io::Error::other)
    }
}

/// `ss -tulnp`, matching the `pid=` field on the line for the port.
#[derive(Debug, Clone)]
pub struct ListeningSocketOwner {
    timeout: Duration,
}

impl ListeningSocketOwner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl OwnerLookup for ListeningSocketOwner {
    fn name(&self) -> &'static str {
        "ss-process"
    }

    async fn lookup(&self, port: u16) -> io::Result<Option<u32>> {
        let output = run_tool("ss", &["-tulnp"], self.timeout).await?;
        Ok(parse_ss_owner(&output, port))
    }
}

/// `ps -eo pid=,args=`, matching a command line that mentions the program.
/// Like [`NameHintOwner`] it only answers for the program's own port.
#[derive(Debug, Clone)]
pub struct ProcessListOwner {
    program: Option<String>,
    port: u16,
    timeout: Duration,
}

impl ProcessListOwner {
    pub fn new(program: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            program: Some(program.into()),
            port,
            timeout,
        }
    }

    pub fn current_program(port: u16, timeout: Duration) -> Self {
        Self {
            program: system::current_program_name(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl OwnerLookup for ProcessListOwner {
    fn name(&self) -> &'static str {
        "process-list"
    }

    async fn lookup(&self, port: u16) -> io::Result<Option<u32>> {
        let Some(program) = self.program.as_deref().filter(|_| port == self.port) else {
            return Ok(None);
        };
        let output = run_tool("ps", &["-eo", "pid=,args="], self.timeout).await?;
        Ok(parse_ps_owner(&output, program, std::process::id()))
    }
}

fn parse_lsof_pids(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|line| line.trim().parse::<u32>().ok())
}

fn parse_ss_owner(output: &str, port: u16) -> Option<u32> {
    output
        .lines()
        .filter(|line| line_mentions_port(line, port))
        .find_map(|line| SS_PID.captures(line)?.get(1)?.as_str().parse().ok())
}

fn parse_ps_owner(output: &str, program: &str, own_pid: u32) -> Option<u32> {
    output.lines().find_map(|line| {
        let line = line.trim_start();
        let (pid, args) = line.split_once(char::is_whitespace)?;
        let pid: u32 = pid.parse().ok()?;
        (pid != own_pid && args.contains(program)).then_some(pid)
    })
}
