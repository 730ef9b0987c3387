//! Lifecycle tests against a shell script standing in for the Java launcher.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use warden_core::{ErrorCode, ProcessSupervisor, SupervisorConfig, SupervisorState};

const ARTIFACT: &str = "fabric-server-launch.jar";

/// Prints a banner and exits cleanly on `stop`.
const RESPONSIVE: &str = r#"#!/bin/sh
echo "[Server thread/INFO]: Done (0.1s)! For help, type \"help\""
while read line; do
  if [ "$line" = "stop" ]; then
    echo "[Server thread/INFO]: Stopping server"
    exit 0
  fi
done
"#;

/// Exits on `stop` without printing anything.
const SILENT: &str = r#"#!/bin/sh
while read line; do
  if [ "$line" = "stop" ]; then
    exit 0
  fi
done
"#;

/// Ignores both the shutdown command and SIGTERM.
const STUBBORN: &str = r#"#!/bin/sh
trap '' TERM
while read line; do :; done
"#;

/// Dies right away.
const CRASHING: &str = r#"#!/bin/sh
echo "Exception in server tick loop"
exit 3
"#;

struct Scripts {
    _dir: TempDir,
    responsive: PathBuf,
    silent: PathBuf,
    stubborn: PathBuf,
    crashing: PathBuf,
    /// `SILENT` under a name no other process on the host carries.
    distinct: PathBuf,
}

/// All launcher scripts, written once before any test spawns a process so
/// no script is still open for writing when another test execs one.
fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        Scripts {
            responsive: write("responsive.sh", RESPONSIVE),
            silent: write("silent.sh", SILENT),
            stubborn: write("stubborn.sh", STUBBORN),
            crashing: write("crashing.sh", CRASHING),
            distinct: write("wdnkilltgt.sh", SILENT),
            _dir: dir,
        }
    })
}

fn config_for(data_dir: &Path, launcher: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::with_data_dir(data_dir);
    config.java_command = launcher.to_string_lossy().into_owned();
    config.check_port_before_start = false;
    config.restart_delay_secs = 0;
    config.kill_grace_secs = 0;
    config.stop_timeout_secs = 5;
    config
}

fn server_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(ARTIFACT), b"").unwrap();
    dir
}

fn supervisor(dir: &TempDir, launcher: &Path) -> ProcessSupervisor {
    ProcessSupervisor::new(config_for(dir.path(), launcher))
}

/// Poll `tail` until a line satisfies `pred`.
async fn wait_for_line(supervisor: &ProcessSupervisor, pred: impl Fn(&str) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if supervisor.tail(Some(50)).iter().any(|line| pred(line)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_start_with_artifact_runs() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.silent);

    let report = supervisor.start().await;
    assert!(report.success, "{}", report.message);
    let pid = report.pid.unwrap();

    let status = supervisor.status();
    assert!(status.running);
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.pid, Some(pid));
    assert!(status.started_at.is_some());

    let tail = supervisor.tail(None);
    assert!(tail.iter().any(|l| l.ends_with(&format!("[INFO] Starting server: {ARTIFACT}"))));
    assert!(tail.iter().any(|l| l.ends_with(&format!("Server process created, PID: {pid}"))));

    assert!(supervisor.stop().await.success);
}

#[tokio::test]
async fn test_start_without_artifact_stays_stopped() {
    let scripts = scripts();
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, &scripts.silent);

    let report = supervisor.start().await;
    assert!(!report.success);
    assert!(report.message.contains("missing"));
    assert_eq!(report.error, Some(ErrorCode::LaunchArtifactMissing));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(!supervisor.status().running);
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let _ = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, Path::new("/nonexistent/warden-java"));

    let report = supervisor.start().await;
    assert!(!report.success);
    assert_eq!(report.error, Some(ErrorCode::ChildSpawnFailed));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(supervisor.tail(Some(1))[0].contains("[ERROR] Failed to start server"));
}

#[tokio::test]
async fn test_send_command_is_logged() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.silent);
    assert!(supervisor.start().await.success);

    let report = supervisor.send_command("say hi").await;
    assert!(report.success, "{}", report.message);
    assert_eq!(report.command.as_deref(), Some("say hi"));

    let tail = supervisor.tail(Some(1));
    assert_eq!(tail.len(), 1);
    assert!(tail[0].ends_with("[COMMAND] say hi"));

    let empty = supervisor.send_command("   ").await;
    assert_eq!(empty.error, Some(ErrorCode::EmptyCommand));

    let split = supervisor.send_command("say a\nstop").await;
    assert_eq!(split.error, Some(ErrorCode::InvalidInput));
    assert!(supervisor.is_running());

    assert!(supervisor.stop().await.success);
}

#[tokio::test]
async fn test_stubborn_server_is_killed() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.stubborn);
    assert!(supervisor.start().await.success);

    let timeout = Duration::from_secs(1);
    let started = Instant::now();
    let report = supervisor.stop_with_timeout(timeout).await;
    let elapsed = started.elapsed();

    assert!(report.success, "{}", report.message);
    assert!(report.message.contains("forcibly"));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(5));

    assert!(!supervisor.status().running);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_graceful_stop_records_final_output() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.responsive);
    assert!(supervisor.start().await.success);
    assert!(wait_for_line(&supervisor, |l| l.contains("[OUTPUT] [Server thread/INFO]: Done")).await);

    let report = supervisor.stop().await;
    assert!(report.success);
    assert_eq!(report.message, "Server stopped");

    let tail = supervisor.tail(Some(2));
    assert!(tail[0].ends_with("[OUTPUT] [Server thread/INFO]: Stopping server"));
    assert!(tail[1].ends_with("[SUCCESS] Server stopped"));
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = Arc::new(supervisor(&dir, &scripts.silent));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start().await })
        })
        .collect();

    let mut reports = Vec::new();
    for handle in handles {
        reports.push(handle.await.unwrap());
    }

    let started: Vec<_> = reports.iter().filter(|r| r.success).collect();
    assert_eq!(started.len(), 1);
    assert!(reports
        .iter()
        .filter(|r| !r.success)
        .all(|r| r.error == Some(ErrorCode::AlreadyRunning)));

    let created = supervisor
        .tail(Some(100))
        .iter()
        .filter(|l| l.contains("Server process created"))
        .count();
    assert_eq!(created, 1);

    assert!(supervisor.stop().await.success);
}

#[tokio::test]
async fn test_stop_twice_changes_nothing_the_second_time() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.silent);
    assert!(supervisor.start().await.success);
    assert!(supervisor.stop().await.success);

    let log_before = std::fs::read(supervisor.config().unified_log_path()).unwrap();
    let snapshot_before = std::fs::read(supervisor.config().snapshot_path()).unwrap();
    let ring_before = supervisor.sink().len();

    let report = supervisor.stop().await;
    assert!(!report.success);
    assert!(report.message.contains("not running"));

    assert_eq!(std::fs::read(supervisor.config().unified_log_path()).unwrap(), log_before);
    assert_eq!(std::fs::read(supervisor.config().snapshot_path()).unwrap(), snapshot_before);
    assert_eq!(supervisor.sink().len(), ring_before);
}

#[tokio::test]
async fn test_restart_replaces_the_process() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.silent);

    let first = supervisor.start().await.pid.unwrap();
    let report = supervisor.restart().await;
    assert!(report.success, "{}", report.message);
    let second = report.pid.unwrap();

    assert_ne!(first, second);
    assert_eq!(supervisor.status().pid, Some(second));
    assert!(supervisor.stop().await.success);
}

#[tokio::test]
async fn test_restart_when_stopped_just_starts() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.silent);

    let report = supervisor.restart().await;
    assert!(report.success, "{}", report.message);
    assert!(supervisor.status().running);
    assert!(supervisor.stop().await.success);
}

#[tokio::test]
async fn test_crash_is_detected_on_next_check() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.crashing);
    assert!(supervisor.start().await.success);

    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.status().running {
        assert!(Instant::now() < deadline, "crash was never observed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(wait_for_line(&supervisor, |l| l.contains("[WARNING] Server process exited unexpectedly (exit code 3)")).await);
    assert!(wait_for_line(&supervisor, |l| l.ends_with("[OUTPUT] Exception in server tick loop")).await);

    // The supervisor is usable again
    let report = supervisor.send_command("list").await;
    assert_eq!(report.error, Some(ErrorCode::NotRunning));
}

#[tokio::test]
async fn test_port_in_use_blocks_start() {
    let scripts = scripts();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = server_dir();
    let mut config = config_for(dir.path(), &scripts.silent);
    config.check_port_before_start = true;
    config.server_port = port;
    let supervisor = ProcessSupervisor::new(config);

    let report = supervisor.start().await;
    assert!(!report.success);
    assert_eq!(report.error, Some(ErrorCode::PortInUse));
    assert!(report.message.contains(&port.to_string()));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_kill_all_without_matches() {
    let dir = server_dir();
    let supervisor = supervisor(&dir, Path::new("java"));

    let report = supervisor.kill_all_matching("warden-no-such-process-xyz").await;
    assert!(report.success);
    assert_eq!(report.killed_count, Some(0));
}

#[tokio::test]
async fn test_kill_all_clears_the_tracked_server() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.distinct);
    assert!(supervisor.start().await.success);

    // The process name is the script's file name; matching ignores case
    let report = supervisor.kill_all_matching("WDNKILLTGT").await;
    assert!(report.success, "{}", report.message);
    assert_eq!(report.killed_count, Some(1));

    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(!supervisor.status().running);

    let tail = supervisor.tail(Some(1));
    assert!(tail[0].ends_with("[WARNING] Tracked server process was terminated"));
}

#[tokio::test]
async fn test_queue_drains_once() {
    let scripts = scripts();
    let dir = server_dir();
    let supervisor = supervisor(&dir, &scripts.silent);
    assert!(supervisor.start().await.success);
    assert!(supervisor.send_command("list").await.success);

    let drained = supervisor.queue().drain();
    assert!(drained.iter().any(|e| e.message == "list"));
    assert!(supervisor.queue().drain().is_empty());

    assert!(supervisor.stop().await.success);
}
