//! The server process supervisor.
//!
//! [`ProcessSupervisor`] owns at most one server child process and drives it
//! through `Stopped → Starting → Running → Stopping → Stopped`.
//!
//! # Locking
//!
//! - `control` (async) serializes `start`, `stop` and `kill_all_matching`,
//!   the operations that replace or remove the managed process.
//! - `slot` (sync) guards the state and the process handle. It is held only
//!   for non-blocking reads and updates, never across an `.await`, so
//!   `status` and `send_command` are never stuck behind a slow stop.
//!
//! Events produced while `control` is held are collected in a [`Journal`]
//! and appended to the sink after it is released.
//!
//! # Crash detection
//!
//! An unexpected exit is noticed lazily, the next time `status`, `start`,
//! `stop` or `send_command` checks liveness. Until then the supervisor may
//! report `Running` for a process that has already exited.

mod capture;
mod launch;
mod state;

pub use state::SupervisorState;

use crate::config::SupervisorConfig;
use crate::error::{Result, WardenError};
use crate::event::OutputEvent;
use crate::port::PortResolver;
use crate::queue::CommandOutputQueue;
use crate::report::{Report, StatusReport};
use crate::sink::{LogCursor, OutputSink};
use crate::system::{self, MetricsSampler};
use capture::Capture;
use chrono::{DateTime, Local};
use launch::LaunchPlan;
use parking_lot::Mutex;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval between exit checks while stopping.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a killed process gets to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stop waits for the last output lines to be recorded.
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The running server process.
struct ManagedProcess {
    pid: u32,
    started_at: DateTime<Local>,
    child: Child,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    capture: Capture,
}

#[derive(Default)]
struct Slot {
    state: SupervisorState,
    process: Option<ManagedProcess>,
}

/// Events to record once the control lock is released.
#[derive(Default)]
struct Journal(Vec<OutputEvent>);

impl Journal {
    fn push(&mut self, event: OutputEvent) {
        self.0.push(event);
    }

    fn flush(self, sink: &OutputSink) {
        for event in self.0 {
            sink.append(event);
        }
    }
}

/// Supervises one game server process.
///
/// Every mutating operation returns a [`Report`]; failures are described in
/// the report, never raised.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    sink: Arc<OutputSink>,
    ports: PortResolver,
    metrics: MetricsSampler,
    control: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
}

impl ProcessSupervisor {
    /// Create a supervisor with a sink and port resolver built from `config`.
    pub fn new(config: SupervisorConfig) -> Self {
        let sink = Arc::new(OutputSink::open(&config));
        let ports = PortResolver::from_config(&config);
        Self::with_parts(config, sink, ports)
    }

    pub fn with_parts(config: SupervisorConfig, sink: Arc<OutputSink>, ports: PortResolver) -> Self {
        Self {
            config,
            sink,
            ports,
            metrics: MetricsSampler::new(),
            control: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<OutputSink> {
        &self.sink
    }

    pub fn queue(&self) -> &Arc<CommandOutputQueue> {
        self.sink.queue()
    }

    pub fn ports(&self) -> &PortResolver {
        &self.ports
    }

    /// Current lifecycle state, without a liveness check.
    pub fn state(&self) -> SupervisorState {
        self.slot.lock().state
    }

    /// Whether a live server process is tracked.
    pub fn is_running(&self) -> bool {
        if let Some(event) = self.check_alive() {
            self.sink.append(event);
        }
        self.slot.lock().state == SupervisorState::Running
    }

    /// Start the server.
    ///
    /// Fails without side effects if a server is already running, if no
    /// launch artifact is found or if the server port is taken.
    pub async fn start(&self) -> Report {
        let mut journal = Journal::default();
        let result = self.start_locked(&mut journal).await;
        journal.flush(&self.sink);

        if let Err(e) = &result {
            debug!(error = %e, "Start refused");
        }
        Report::from(result)
    }

    async fn start_locked(&self, journal: &mut Journal) -> Result<Report> {
        let _control = self.control.lock().await;

        if let Some(event) = self.check_alive() {
            journal.push(event);
        }
        if self.slot.lock().state.is_active() {
            return Err(WardenError::AlreadyRunning);
        }

        let plan = LaunchPlan::prepare(&self.config)?;
        self.guard_port(journal).await?;

        self.slot.lock().state = SupervisorState::Starting;
        journal.push(OutputEvent::info(format!(
            "Starting server: {}",
            plan.artifact_name()
        )));
        info!(artifact = %plan.artifact.display(), heap_mb = ?plan.heap_mb, "Starting server");

        let process = match self.spawn(&plan) {
            Ok(process) => process,
            Err(e) => {
                self.slot.lock().state = SupervisorState::Stopped;
                journal.push(OutputEvent::error(format!("Failed to start server: {}", e)));
                return Err(e);
            }
        };

        let pid = process.pid;
        {
            let mut slot = self.slot.lock();
            slot.process = Some(process);
            slot.state = SupervisorState::Running;
        }

        info!(pid, "Server process created");
        journal.push(OutputEvent::success(format!(
            "Server process created, PID: {}",
            pid
        )));

        Ok(Report::ok(format!("Server starting, PID: {}", pid)).with_pid(pid))
    }

    async fn guard_port(&self, journal: &mut Journal) -> Result<()> {
        if !self.config.check_port_before_start {
            return Ok(());
        }

        let port = self.config.server_port;
        let probe = self.ports.probe(port).await;

        if probe.inconclusive {
            journal.push(OutputEvent::warning(format!(
                "Could not determine whether port {} is free, starting anyway",
                port
            )));
            return Ok(());
        }

        if probe.in_use {
            let owner = match probe.owner_pid {
                Some(pid) => Some(pid),
                None => self.ports.identify_owner(port).await,
            };
            warn!(port, owner = ?owner, "Server port is already in use");
            return Err(WardenError::PortInUse { port, owner });
        }

        Ok(())
    }

    fn spawn(&self, plan: &LaunchPlan) -> Result<ManagedProcess> {
        let (mut child, output) = plan.spawn()?;

        let not_captured = |stream: &str| {
            WardenError::spawn_failed(
                &plan.program,
                std::io::Error::other(format!("{} was not captured", stream)),
            )
        };
        // On these error paths the child is killed when dropped
        let pid = child.id().ok_or_else(|| not_captured("pid"))?;
        let stdin = child.stdin.take().ok_or_else(|| not_captured("stdin"))?;

        Ok(ManagedProcess {
            pid,
            started_at: Local::now(),
            child,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            capture: Capture::spawn(output, self.sink.clone()),
        })
    }

    /// Stop the server, waiting up to the configured stop timeout.
    pub async fn stop(&self) -> Report {
        self.stop_with_timeout(self.config.stop_timeout()).await
    }

    /// Stop the server.
    ///
    /// Writes the shutdown command to the server's stdin and waits up to
    /// `timeout` for it to exit, then kills it. Either way the process is
    /// reaped and the state is `Stopped` when this returns successfully.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Report {
        let mut journal = Journal::default();

        let result = match self.stop_locked(timeout, &mut journal).await {
            Ok((report, capture)) => {
                capture.finish(CAPTURE_DRAIN_TIMEOUT).await;
                Ok(report)
            }
            Err(e) => Err(e),
        };

        journal.flush(&self.sink);
        Report::from(result)
    }

    async fn stop_locked(&self, timeout: Duration, journal: &mut Journal) -> Result<(Report, Capture)> {
        let _control = self.control.lock().await;

        if let Some(event) = self.check_alive() {
            journal.push(event);
        }

        let (pid, stdin) = {
            let mut slot = self.slot.lock();
            let Some(process) = slot.process.as_ref() else {
                return Err(WardenError::NotRunning);
            };
            let handles = (process.pid, process.stdin.clone());
            slot.state = SupervisorState::Stopping;
            handles
        };

        info!(pid, "Stopping server");
        let deadline = Instant::now() + timeout;

        let line = format!("{}\n", self.config.shutdown_command);
        let request = async {
            let mut stdin = stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        match tokio::time::timeout_at(deadline, request).await {
            Ok(Ok(())) => debug!(pid, "Shutdown command sent"),
            Ok(Err(e)) => warn!(pid, error = %e, "Failed to send shutdown command"),
            Err(_) => warn!(pid, "Timed out sending shutdown command"),
        }

        let forced = !self.wait_for_exit(deadline).await;
        if forced {
            warn!(pid, "Server did not exit within {:?}, killing", timeout);
            self.force_kill();
            if !self.wait_for_exit(Instant::now() + KILL_REAP_TIMEOUT).await {
                warn!(pid, "Killed server was not reaped in time");
            }
        }

        let process = {
            let mut slot = self.slot.lock();
            slot.state = SupervisorState::Stopped;
            slot.process.take()
        };
        let Some(process) = process else {
            return Err(WardenError::NotRunning);
        };

        let report = if forced {
            journal.push(OutputEvent::warning(format!(
                "Server did not stop within {}s and was killed",
                timeout.as_secs()
            )));
            Report::ok("Server was forcibly stopped").with_pid(pid)
        } else {
            journal.push(OutputEvent::success("Server stopped"));
            Report::ok("Server stopped").with_pid(pid)
        };
        info!(pid, forced, "Server stopped");

        Ok((report, process.capture))
    }

    /// Stop (if running), wait the restart delay, then start.
    ///
    /// A failed stop is returned as is and the start is not attempted.
    pub async fn restart(&self) -> Report {
        if self.is_running() {
            let stopped = self.stop().await;
            if !stopped.success {
                return stopped;
            }
            tokio::time::sleep(self.config.restart_delay()).await;
        }
        self.start().await
    }

    /// Write one line to the server's stdin.
    ///
    /// The command is recorded with level `command` before it is written.
    pub async fn send_command(&self, text: &str) -> Report {
        Report::from(self.send_command_inner(text).await)
    }

    async fn send_command_inner(&self, text: &str) -> Result<Report> {
        if let Some(event) = self.check_alive() {
            self.sink.append(event);
        }

        let stdin = {
            let slot = self.slot.lock();
            match (&slot.state, slot.process.as_ref()) {
                (SupervisorState::Running, Some(process)) => process.stdin.clone(),
                _ => return Err(WardenError::NotRunning),
            }
        };

        let command = text.trim();
        if command.is_empty() {
            return Err(WardenError::EmptyCommand);
        }
        if command.contains(['\n', '\r']) {
            return Err(WardenError::invalid_input("Command must be a single line"));
        }

        self.sink.append(OutputEvent::command(command));

        let line = format!("{}\n", command);
        let written = async {
            let mut stdin = stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(command, error = %e, "Failed to send command");
            self.sink
                .append(OutputEvent::error(format!("Failed to send command: {}", e)));
            return Err(WardenError::CommandWrite(e));
        }

        debug!(command, "Command sent");
        Ok(Report::ok(format!("Command '{}' sent", command)).with_command(command))
    }

    /// Current state with best-effort resource metrics.
    pub fn status(&self) -> StatusReport {
        if let Some(event) = self.check_alive() {
            self.sink.append(event);
        }

        let (state, tracked) = {
            let slot = self.slot.lock();
            let tracked = slot
                .process
                .as_ref()
                .map(|process| (process.pid, process.started_at));
            (slot.state, tracked)
        };

        let Some((pid, started_at)) = tracked else {
            return StatusReport::stopped(state);
        };

        let metrics = self.metrics.sample(pid).unwrap_or_default();
        let uptime_secs = (Local::now() - started_at).num_seconds().max(0) as u64;

        StatusReport {
            running: true,
            state,
            pid: Some(pid),
            started_at: Some(started_at),
            uptime_secs,
            memory_usage_mb: metrics.memory_mb,
            cpu_percent: metrics.cpu_percent,
        }
    }

    /// Ask every process whose name contains `name` (case-insensitive) to
    /// terminate.
    ///
    /// This is a blunt recovery tool that reaches well beyond the supervised
    /// server: it signals any matching process on the host this user may
    /// signal. If the tracked server is among the targets it is reaped and
    /// the supervisor returns to `Stopped`.
    pub async fn kill_all_matching(&self, name: &str) -> Report {
        let mut journal = Journal::default();
        let result = self.kill_all_locked(name, &mut journal).await;
        journal.flush(&self.sink);
        Report::from(result)
    }

    async fn kill_all_locked(&self, name: &str, journal: &mut Journal) -> Result<Report> {
        let needle = name.trim().to_string();
        if needle.is_empty() {
            return Err(WardenError::invalid_input("Process name must not be empty"));
        }

        let _control = self.control.lock().await;

        let summary = {
            let needle = needle.clone();
            tokio::task::spawn_blocking(move || system::terminate_matching(&needle))
                .await
                .map_err(|e| WardenError::Io(std::io::Error::other(e)))?
        };

        for (pid, process_name) in &summary.terminated {
            journal.push(OutputEvent::info(format!(
                "Terminating process: PID {} - {}",
                pid, process_name
            )));
        }

        let count = summary.terminated.len();
        if count > 0 {
            tokio::time::sleep(self.config.kill_grace()).await;
        }

        let tracked = self.slot.lock().process.as_ref().map(|process| process.pid);
        let hit_tracked = match tracked {
            Some(pid) => summary.terminated.iter().any(|(target, _)| *target == pid),
            None => false,
        };

        if hit_tracked {
            if !self.wait_for_exit(Instant::now()).await {
                self.force_kill();
                self.wait_for_exit(Instant::now() + KILL_REAP_TIMEOUT).await;
            }
            let process = {
                let mut slot = self.slot.lock();
                slot.state = SupervisorState::Stopped;
                slot.process.take()
            };
            drop(process);
            journal.push(OutputEvent::warning("Tracked server process was terminated"));
        }

        info!(needle = %needle, count, skipped = summary.skipped, "Bulk termination finished");
        Ok(Report::ok(format!(
            "Terminated {} process(es) matching '{}'",
            count, needle
        ))
        .with_killed_count(count))
    }

    /// The last `n` lines of activity (default: the configured tail length).
    pub fn tail(&self, n: Option<usize>) -> Vec<String> {
        self.sink.tail(n.unwrap_or(self.config.tail_lines))
    }

    /// Lines logged since `cursor`, for incremental polling.
    pub fn drain_since(&self, cursor: LogCursor) -> (Vec<String>, LogCursor) {
        self.sink.drain_since(cursor)
    }

    /// Reap a `Running` process that has exited on its own.
    ///
    /// Returns the event describing the crash, for the caller to record.
    fn check_alive(&self) -> Option<OutputEvent> {
        let mut slot = self.slot.lock();
        if slot.state != SupervisorState::Running {
            return None;
        }

        let status = match slot.process.as_mut()?.child.try_wait() {
            Ok(Some(status)) => describe_exit(status),
            Ok(None) => return None,
            Err(e) => format!("status unavailable: {}", e),
        };

        let process = slot.process.take();
        slot.state = SupervisorState::Stopped;
        drop(slot);

        let pid = process.as_ref().map(|p| p.pid);
        warn!(pid = ?pid, status = %status, "Server process exited unexpectedly");
        Some(OutputEvent::warning(format!(
            "Server process exited unexpectedly ({})",
            status
        )))
    }

    /// Poll the tracked process until it exits or `deadline` passes.
    async fn wait_for_exit(&self, deadline: Instant) -> bool {
        loop {
            if self.has_exited() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn has_exited(&self) -> bool {
        let mut slot = self.slot.lock();
        let Some(process) = slot.process.as_mut() else {
            return true;
        };

        match process.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = process.pid, status = %describe_exit(status), "Server process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = process.pid, error = %e, "Failed to check server process");
                true
            }
        }
    }

    fn force_kill(&self) {
        let mut slot = self.slot.lock();
        if let Some(process) = slot.process.as_mut() {
            if let Err(e) = process.child.start_kill() {
                debug!(pid = process.pid, error = %e, "Kill request failed");
            }
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("ProcessSupervisor")
            .field("state", &slot.state)
            .field("pid", &slot.process.as_ref().map(|p| p.pid))
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor_in(dir: &TempDir) -> ProcessSupervisor {
        let mut config = SupervisorConfig::with_data_dir(dir.path());
        config.check_port_before_start = false;
        ProcessSupervisor::new(config)
    }

    #[tokio::test]
    async fn test_stop_when_stopped_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);

        let report = supervisor.stop().await;
        assert!(!report.success);
        assert!(report.message.contains("not running"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!supervisor.config().unified_log_path().exists());
        assert!(!supervisor.config().snapshot_path().exists());
    }

    #[tokio::test]
    async fn test_send_command_when_stopped() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);

        let report = supervisor.send_command("list").await;
        assert!(!report.success);
        assert_eq!(report.error, Some(crate::error::ErrorCode::NotRunning));
        assert!(supervisor.sink().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_artifact() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);

        let report = supervisor.start().await;
        assert!(!report.success);
        assert!(report.message.contains("missing"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_kill_all_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);

        let report = supervisor.kill_all_matching("   ").await;
        assert!(!report.success);
        assert_eq!(report.error, Some(crate::error::ErrorCode::InvalidInput));
    }

    #[test]
    fn test_status_when_stopped() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);

        let status = supervisor.status();
        assert!(!status.running);
        assert_eq!(status.state, SupervisorState::Stopped);
        assert_eq!(status.pid, None);
        assert_eq!(status.uptime_secs, 0);
    }
}
