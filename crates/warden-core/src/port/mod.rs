//! Port occupancy probing and owner identification.
//!
//! Both questions are answered by ordered chains of strategies. A strategy
//! either gives a definitive answer or fails with an environment error
//! (missing tool, permission denied, timeout), in which case the next one is
//! tried.
//!
//! ```text
//! probe(port)          identify_owner(port)
//!   1. TCP connect       1. lsof
//!   2. listener table    2. process-name hints
//!   3. ss -tuln          3. ss -tulnp
//!   4. netstat -tuln     4. process list scan
//! ```
//!
//! When every probe strategy errors, the port is reported as free with
//! `inconclusive` set. This lets a start attempt proceed rather than block on
//! missing diagnostics, at the risk of a false negative.

pub mod owner;
pub mod strategies;

pub use owner::{ListeningSocketOwner, LsofOwner, NameHintOwner, OwnerLookup, ProcessListOwner};
pub use strategies::{ListenerTableProbe, ProbeStrategy, SocketToolProbe, TcpConnectProbe};

use crate::config::SupervisorConfig;
use serde::{Deserialize, Serialize};
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Definitive answer from a single probe strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub in_use: bool,
    pub owner_pid: Option<u32>,
}

impl Detection {
    pub fn free() -> Self {
        Self {
            in_use: false,
            owner_pid: None,
        }
    }

    pub fn bound(owner_pid: Option<u32>) -> Self {
        Self {
            in_use: true,
            owner_pid,
        }
    }
}

/// Result of [`PortResolver::probe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortProbe {
    pub port: u16,
    pub in_use: bool,
    /// Best effort; may be absent even when `in_use` is true
    pub owner_pid: Option<u32>,
    /// Every strategy failed and `in_use` is an assumption
    pub inconclusive: bool,
    /// Name of the strategy that answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_by: Option<String>,
}

/// Layered port prober.
pub struct PortResolver {
    strategies: Vec<Box<dyn ProbeStrategy>>,
    owners: Vec<Box<dyn OwnerLookup>>,
}

impl PortResolver {
    /// The standard detection chain, with owners taken from socket tables
    /// only.
    pub fn new(probe_timeout: Duration, tool_timeout: Duration) -> Self {
        Self {
            strategies: vec![
                Box::new(TcpConnectProbe::new(probe_timeout)),
                Box::new(ListenerTableProbe),
                Box::new(SocketToolProbe::ss(tool_timeout)),
                Box::new(SocketToolProbe::netstat(tool_timeout)),
            ],
            owners: vec![
                Box::new(LsofOwner::new(tool_timeout)),
                Box::new(ListeningSocketOwner::new(tool_timeout)),
            ],
        }
    }

    /// Attribute `port` to another running instance of this program when
    /// `lsof` cannot name its owner. Other ports are unaffected.
    pub fn with_program_hint(mut self, port: u16, tool_timeout: Duration) -> Self {
        let at = self.owners.len().min(1);
        self.owners.insert(at, Box::new(NameHintOwner::current_program(port)));
        self.owners.push(Box::new(ProcessListOwner::current_program(port, tool_timeout)));
        self
    }

    /// The standard chains, with program hints scoped to the console port.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.probe_timeout(), config.tool_timeout())
            .with_program_hint(config.console_port, config.tool_timeout())
    }

    /// A resolver with custom chains, tried in the order given.
    pub fn with_chains(
        strategies: Vec<Box<dyn ProbeStrategy>>,
        owners: Vec<Box<dyn OwnerLookup>>,
    ) -> Self {
        Self { strategies, owners }
    }

    /// Is anything bound to `port`?
    pub async fn probe(&self, port: u16) -> PortProbe {
        for strategy in &self.strategies {
            match strategy.detect(port).await {
                Ok(detection) => {
                    debug!(
                        port,
                        strategy = strategy.name(),
                        in_use = detection.in_use,
                        "Port probe answered"
                    );
                    return PortProbe {
                        port,
                        in_use: detection.in_use,
                        owner_pid: detection.owner_pid,
                        inconclusive: false,
                        detected_by: Some(strategy.name().to_string()),
                    };
                }
                Err(e) => {
                    debug!(port, strategy = strategy.name(), error = %e, "Port probe strategy unavailable");
                }
            }
        }

        warn!(port, "Every port probe failed, assuming the port is free");
        PortProbe {
            port,
            in_use: false,
            owner_pid: None,
            inconclusive: true,
            detected_by: None,
        }
    }

    /// Best-effort PID of the process holding `port`.
    ///
    /// `None` after every lookup is a normal outcome.
    pub async fn identify_owner(&self, port: u16) -> Option<u32> {
        for lookup in &self.owners {
            match lookup.lookup(port).await {
                Ok(Some(pid)) => {
                    debug!(port, pid, lookup = lookup.name(), "Port owner identified");
                    return Some(pid);
                }
                Ok(None) => {
                    debug!(port, lookup = lookup.name(), "Port owner not found");
                }
                Err(e) => {
                    debug!(port, lookup = lookup.name(), error = %e, "Port owner lookup failed");
                }
            }
        }
        None
    }

    /// [`probe`](Self::probe), then [`identify_owner`](Self::identify_owner)
    /// if the port is bound by an unknown process.
    pub async fn resolve(&self, port: u16) -> PortProbe {
        let mut probe = self.probe(port).await;
        if probe.in_use && probe.owner_pid.is_none() {
            probe.owner_pid = self.identify_owner(port).await;
        }
        probe
    }
}

impl Default for PortResolver {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

impl std::fmt::Debug for PortResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strategies: Vec<_> = self.strategies.iter().map(|s| s.name()).collect();
        let owners: Vec<_> = self.owners.iter().map(|o| o.name()).collect();
        f.debug_struct("PortResolver")
            .field("strategies", &strategies)
            .field("owners", &owners)
            .finish()
    }
}

/// Run a diagnostic tool and return its stdout.
///
/// A tool that is not on `PATH`, exceeds `timeout` or exits unsuccessfully is
/// an environment error.
pub(crate) async fn run_tool(program: &str, args: &[&str], timeout: Duration) -> io::Result<String> {
    let path = which::which(program)
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("{}: {}", program, e)))?;

    let output = tokio::time::timeout(
        timeout,
        Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", program)))??;

    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{} exited with {}",
            program, output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Does any whitespace-separated token of `line` name `port` as its port
/// component (`addr:port`, or BSD-style `addr.port`)?
pub(crate) fn line_mentions_port(line: &str, port: u16) -> bool {
    let colon = format!(":{}", port);
    let dot = format!(".{}", port);
    line.split_whitespace()
        .any(|token| token.ends_with(&colon) || token.ends_with(&dot))
}

/// Does any line of a socket listing name `port`?
pub(crate) fn mentions_port(output: &str, port: u16) -> bool {
    output.lines().any(|line| line_mentions_port(line, port))
}
