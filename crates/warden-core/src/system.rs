//! Host process table: memory, metrics, and termination of foreign processes.
//!
//! All reads are best-effort. A host that hides process information yields
//! zeros or empty lists, never errors.

use parking_lot::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

/// Interval between liveness checks while waiting for a process to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Total physical memory of the host in bytes, 0 if unknown.
pub fn total_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

/// File stem of the running executable, used as a process-name hint.
pub fn current_program_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

/// Resource usage of a single process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessMetrics {
    pub memory_mb: f64,
    pub cpu_percent: f32,
}

/// Samples process metrics.
///
/// CPU usage is a delta between two refreshes, so the sampler keeps its
/// process table between calls; the first sample of a PID reads 0%.
pub struct MetricsSampler {
    system: Mutex<System>,
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self, pid: u32) -> Option<ProcessMetrics> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let process = system.process(pid)?;
        Some(ProcessMetrics {
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
            cpu_percent: process.cpu_usage(),
        })
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSampler").finish_non_exhaustive()
    }
}

/// `(pid, name)` of every process other than this one whose name contains
/// `needle`, case-insensitively.
pub fn processes_matching(needle: &str) -> Vec<(u32, String)> {
    let needle = needle.to_lowercase();
    let own_pid = std::process::id();

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut matches: Vec<(u32, String)> = system
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let name = process.name().to_string_lossy().into_owned();
            let pid = pid.as_u32();
            (pid != own_pid && name.to_lowercase().contains(&needle)).then_some((pid, name))
        })
        .collect();
    matches.sort_unstable_by_key(|(pid, _)| *pid);
    matches
}

/// Outcome of [`terminate_matching`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationSummary {
    /// Processes a termination request was delivered to
    pub terminated: Vec<(u32, String)>,
    /// Processes that had already exited or refused the signal
    pub skipped: usize,
}

/// Ask every process whose name contains `needle` to terminate.
///
/// Does not wait. Per-process failures (already exited, permission denied)
/// are counted in `skipped`, never raised.
pub fn terminate_matching(needle: &str) -> TerminationSummary {
    let needle = needle.to_lowercase();
    let own_pid = std::process::id();

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut summary = TerminationSummary::default();
    let mut targets: Vec<_> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            pid.as_u32() != own_pid
                && process
                    .name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&needle)
        })
        .collect();
    targets.sort_unstable_by_key(|(pid, _)| pid.as_u32());

    for (pid, process) in targets {
        let name = process.name().to_string_lossy().into_owned();
        // Fall back to the platform kill where SIGTERM is unsupported
        let delivered = process
            .kill_with(Signal::Term)
            .unwrap_or_else(|| process.kill());

        if delivered {
            debug!(pid = pid.as_u32(), name = %name, "Termination requested");
            summary.terminated.push((pid.as_u32(), name));
        } else {
            warn!(pid = pid.as_u32(), name = %name, "Could not terminate process");
            summary.skipped += 1;
        }
    }

    summary
}

/// Is `pid` a live (non-zombie) process?
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Request termination of a foreign process and wait up to `timeout` for it
/// to disappear.
///
/// Returns `true` once the process is gone (including when it was gone
/// already), `false` if it is still alive at the deadline or refused the
/// signal.
pub async fn terminate_pid(pid: u32, timeout: Duration) -> bool {
    if !is_alive(pid) {
        return true;
    }

    if !send_terminate(pid) {
        return !is_alive(pid);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            debug!(pid, "Process exited after termination request");
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let gone = !is_alive(pid);
    if !gone {
        warn!(pid, "Process still alive after {:?}", timeout);
    }
    gone
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match kill(NixPid::from_raw(raw), NixSignal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(e) => {
            warn!(pid, error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_none_or(|process| process.kill())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_memory_is_reported() {
        // Every supported CI host exposes physical memory
        assert!(total_memory_bytes() > 0);
    }

    #[test]
    fn test_own_process_is_alive_and_never_matched() {
        assert!(is_alive(std::process::id()));

        let own_name = current_program_name().unwrap();
        let matches = processes_matching(&own_name);
        assert!(matches.iter().all(|(pid, _)| *pid != std::process::id()));
    }

    #[test]
    fn test_sampler_reads_own_metrics() {
        let sampler = MetricsSampler::new();
        let metrics = sampler.sample(std::process::id()).unwrap();
        assert!(metrics.memory_mb > 0.0);
        assert!(metrics.cpu_percent >= 0.0);
    }

    #[test]
    fn test_terminate_matching_nothing() {
        let summary = terminate_matching("warden-no-such-process-name-xyz");
        assert!(summary.terminated.is_empty());
        assert_eq!(summary.skipped, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_pid_stops_a_sleeper() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        // Reap concurrently so the child does not linger as a zombie
        let reaper = tokio::spawn(async move { child.wait().await });

        assert!(terminate_pid(pid, Duration::from_secs(5)).await);
        assert!(reaper.await.unwrap().is_ok());
    }
}
