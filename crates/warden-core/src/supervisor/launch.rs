//! Building the server command line.

use crate::config::SupervisorConfig;
use super::capture::ServerOutput;
use crate::error::{Result, WardenError};
use crate::system;
#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Everything needed to spawn one server process.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub artifact: PathBuf,
    pub working_dir: PathBuf,
    pub heap_mb: Option<u64>,
}

impl LaunchPlan {
    /// Locate the launch artifact and size the heap.
    ///
    /// Fails with `LaunchArtifactMissing` when nothing in the data directory
    /// matches the launch pattern.
    pub fn prepare(config: &SupervisorConfig) -> Result<Self> {
        let artifact = find_artifact(&config.data_dir, &config.launch_pattern)?;
        let heap_mb = heap_megabytes(system::total_memory_bytes(), config.memory_fraction);
        Ok(Self::new(config, artifact, heap_mb))
    }

    fn new(config: &SupervisorConfig, artifact: PathBuf, heap_mb: Option<u64>) -> Self {
        let mut args = Vec::new();
        if let Some(mb) = heap_mb {
            args.push(format!("-Xms{}M", mb));
            args.push(format!("-Xmx{}M", mb));
        }
        args.push("-jar".to_string());
        // Relative to the working directory
        args.push(artifact_name(&artifact));
        args.extend(config.server_args.iter().cloned());

        Self {
            program: config.java_command.clone(),
            args,
            artifact,
            working_dir: config.data_dir.clone(),
            heap_mb,
        }
    }

    pub fn artifact_name(&self) -> String {
        artifact_name(&self.artifact)
    }

    /// Spawn with stdin piped and stdout and stderr sharing one pipe, so
    /// lines from both keep the order the server wrote them in.
    ///
    /// The child is killed if its handle is dropped.
    #[cfg(unix)]
    pub fn spawn(&self) -> Result<(Child, ServerOutput)> {
        debug!(program = %self.program, args = ?self.args, "Spawning server");
        let failed = |e: std::io::Error| WardenError::spawn_failed(&self.program, e);

        let (read, write) = output_pipe().map_err(failed)?;
        let stdout = write.try_clone().map_err(failed)?;

        // The command and its copies of the write end are dropped with this
        // statement, so the pipe reaches EOF once the server exits
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(write))
            .kill_on_drop(true)
            .spawn()
            .map_err(failed)?;

        let output = tokio::net::unix::pipe::Receiver::from_owned_fd(read).map_err(failed)?;
        Ok((child, ServerOutput::Combined(output)))
    }

    /// Spawn with all three standard streams piped.
    ///
    /// The child is killed if its handle is dropped.
    #[cfg(not(unix))]
    pub fn spawn(&self) -> Result<(Child, ServerOutput)> {
        debug!(program = %self.program, args = ?self.args, "Spawning server");
        let failed = |e: std::io::Error| WardenError::spawn_failed(&self.program, e);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(failed)?;

        let not_captured =
            |stream: &str| failed(std::io::Error::other(format!("{} was not captured", stream)));
        let stdout = child.stdout.take().ok_or_else(|| not_captured("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| not_captured("stderr"))?;
        Ok((child, ServerOutput::Split(stdout, stderr)))
    }
}

/// A close-on-exec pipe for the server's combined output.
#[cfg(unix)]
fn output_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// First file in `dir`, by name, whose name matches `pattern`.
pub(crate) fn find_artifact(dir: &Path, pattern: &str) -> Result<PathBuf> {
    let missing = || WardenError::LaunchArtifactMissing {
        pattern: pattern.to_string(),
        dir: dir.to_path_buf(),
    };

    let matcher = glob::Pattern::new(pattern)
        .map_err(|e| WardenError::config(format!("Invalid launch pattern '{}': {}", pattern, e)))?;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => return Err(e.into()),
    };

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter(|entry| matcher.matches(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();

    candidates.sort();
    candidates.into_iter().next().ok_or_else(missing)
}

/// `fraction` of `total_bytes`, in whole megabytes; `None` if the host
/// memory is unknown.
pub(crate) fn heap_megabytes(total_bytes: u64, fraction: f64) -> Option<u64> {
    let total_mb = total_bytes / (1024 * 1024);
    if total_mb == 0 {
        return None;
    }
    Some(((total_mb as f64 * fraction) as u64).max(1))
}

fn artifact_name(artifact: &Path) -> String {
    artifact
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| artifact.to_string_lossy().into_owned())
}
