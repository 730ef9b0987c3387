//! Supervisor configuration.
//!
//! Configuration is read from a TOML file, then overridden from `WARDEN_*`
//! environment variables, then validated. Every field has a default, so an
//! empty file (or no file at all) yields a working configuration.
//!
//! # Example
//!
//! ```toml
//! data_dir = "/srv/minecraft"
//! java_command = "/usr/lib/jvm/java-21/bin/java"
//! memory_fraction = 0.6
//! stop_timeout_secs = 45
//! ```
//!
//! ```no_run
//! use warden_core::config::SupervisorConfig;
//! use std::path::Path;
//!
//! # fn example() -> warden_core::Result<()> {
//! let config = SupervisorConfig::load_from_path(Path::new("warden.toml"))?;
//! println!("Server data lives in {}", config.data_dir.display());
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

// Environment variable names
pub const ENV_DATA_DIR: &str = "WARDEN_DATA_DIR";
pub const ENV_LAUNCH_PATTERN: &str = "WARDEN_LAUNCH_PATTERN";
pub const ENV_JAVA: &str = "WARDEN_JAVA";
pub const ENV_MEMORY_FRACTION: &str = "WARDEN_MEMORY_FRACTION";
pub const ENV_STOP_TIMEOUT: &str = "WARDEN_STOP_TIMEOUT";
pub const ENV_SERVER_PORT: &str = "WARDEN_SERVER_PORT";
pub const ENV_CONSOLE_PORT: &str = "WARDEN_CONSOLE_PORT";

/// File name of the durable event log, inside `<data_dir>/logs/`.
pub const UNIFIED_LOG_FILE: &str = "unified.log";

/// File name of the ring snapshot, inside `<data_dir>/`.
pub const SNAPSHOT_FILE: &str = ".persistent_output.json";

/// Everything the supervisor needs to know about the server it manages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Working directory of the server; also holds logs and the snapshot
    pub data_dir: PathBuf,
    /// Glob matched against file names in `data_dir` to find the launch jar
    pub launch_pattern: String,
    /// Launcher executable
    pub java_command: String,
    /// Arguments appended after the jar path
    pub server_args: Vec<String>,
    /// Share of total system memory given to the server heap
    pub memory_fraction: f64,
    /// Line written to stdin to request a graceful shutdown
    pub shutdown_command: String,
    /// How long `stop()` waits for a natural exit before killing
    pub stop_timeout_secs: u64,
    /// Pause between the stop and start halves of a restart
    pub restart_delay_secs: u64,
    /// Pause after a bulk termination before checking the tracked process
    pub kill_grace_secs: u64,
    /// Capacity of the in-memory ring and the command output queue
    pub ring_capacity: usize,
    /// Default line count for `tail`
    pub tail_lines: usize,
    /// Port the server listens on
    pub server_port: u16,
    /// Refuse to start while `server_port` is bound by someone else
    pub check_port_before_start: bool,
    /// Port of the operator console itself
    pub console_port: u16,
    /// Timeout of the direct TCP connect probe
    pub probe_timeout_ms: u64,
    /// Timeout for external diagnostic tools (`ss`, `netstat`, `lsof`, `ps`)
    pub tool_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            launch_pattern: "fabric-server-launch*.jar".to_string(),
            java_command: "java".to_string(),
            server_args: vec!["nogui".to_string()],
            memory_fraction: 0.7,
            shutdown_command: "stop".to_string(),
            stop_timeout_secs: 30,
            restart_delay_secs: 2,
            kill_grace_secs: 2,
            ring_capacity: 500,
            tail_lines: 100,
            server_port: 25565,
            check_port_before_start: true,
            console_port: 5000,
            probe_timeout_ms: 1000,
            tool_timeout_secs: 5,
        }
    }
}

impl SupervisorConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a specific path
    ///
    /// A missing file is not an error: defaults are used, then environment
    /// overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, if an
    /// environment override is malformed, or if validation fails
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            debug!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .map_err(|e| WardenError::config(format!("Failed to read config file: {}", e)))?;
            toml::from_str(&content)
                .map_err(|e| WardenError::config(format!("Failed to parse config file: {}", e)))?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded (data dir: {})", config.data_dir.display());
        Ok(config)
    }

    /// Save configuration to a specific path atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or cannot be written
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WardenError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| WardenError::config(format!("Failed to serialize config: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, content)
            .map_err(|e| WardenError::config(format!("Failed to write config file: {}", e)))?;
        std::fs::rename(&temp_path, path)
            .map_err(|e| WardenError::config(format!("Failed to rename config file: {}", e)))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Merge environment variable overrides into the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric environment variable does not parse
    pub fn merge_env_vars(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            debug!("Overriding data_dir from environment: {}", dir);
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(pattern) = std::env::var(ENV_LAUNCH_PATTERN) {
            debug!("Overriding launch_pattern from environment: {}", pattern);
            self.launch_pattern = pattern;
        }

        if let Ok(java) = std::env::var(ENV_JAVA) {
            debug!("Overriding java_command from environment: {}", java);
            self.java_command = java;
        }

        if let Some(fraction) = parse_env::<f64>(ENV_MEMORY_FRACTION)? {
            self.memory_fraction = fraction;
        }

        if let Some(secs) = parse_env::<u64>(ENV_STOP_TIMEOUT)? {
            self.stop_timeout_secs = secs;
        }

        if let Some(port) = parse_env::<u16>(ENV_SERVER_PORT)? {
            self.server_port = port;
        }

        if let Some(port) = parse_env::<u16>(ENV_CONSOLE_PORT)? {
            self.console_port = port;
        }

        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(WardenError::config(format!(
                "memory_fraction must be in (0, 1], got {}",
                self.memory_fraction
            )));
        }

        if self.launch_pattern.trim().is_empty() {
            return Err(WardenError::config("launch_pattern must not be empty"));
        }

        glob::Pattern::new(&self.launch_pattern).map_err(|e| {
            WardenError::config(format!(
                "launch_pattern '{}' is not a valid glob: {}",
                self.launch_pattern, e
            ))
        })?;

        if self.java_command.trim().is_empty() {
            return Err(WardenError::config("java_command must not be empty"));
        }

        if self.shutdown_command.trim().is_empty() {
            return Err(WardenError::config("shutdown_command must not be empty"));
        }

        if self.ring_capacity == 0 {
            return Err(WardenError::config("ring_capacity must be at least 1"));
        }

        if self.stop_timeout_secs == 0 {
            return Err(WardenError::config("stop_timeout_secs must be at least 1"));
        }

        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn unified_log_path(&self) -> PathBuf {
        self.logs_dir().join(UNIFIED_LOG_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw.trim().parse::<T>().map_err(|e| {
                WardenError::config(format!("Invalid value for {}: '{}' ({})", name, raw, e))
            })?;
            debug!("Overriding {} from environment: {}", name, raw);
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.launch_pattern, "fabric-server-launch*.jar");
        assert_eq!(config.memory_fraction, 0.7);
        assert_eq!(config.stop_timeout(), Duration::from_secs(30));
        assert_eq!(config.restart_delay(), Duration::from_secs(2));
        assert_eq!(config.ring_capacity, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths() {
        let config = SupervisorConfig::with_data_dir("/srv/mc");
        assert_eq!(config.unified_log_path(), PathBuf::from("/srv/mc/logs/unified.log"));
        assert_eq!(config.snapshot_path(), PathBuf::from("/srv/mc/.persistent_output.json"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SupervisorConfig::default();

        config.memory_fraction = 0.0;
        assert!(config.validate().is_err());
        config.memory_fraction = 1.5;
        assert!(config.validate().is_err());
        config.memory_fraction = 1.0;
        assert!(config.validate().is_ok());

        config.launch_pattern = "[unclosed".to_string();
        assert!(config.validate().is_err());
        config.launch_pattern = "server*.jar".to_string();

        config.ring_capacity = 0;
        assert!(config.validate().is_err());
        config.ring_capacity = 10;

        config.shutdown_command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("warden.toml");

        let mut config = SupervisorConfig::with_data_dir(temp_dir.path().join("data"));
        config.stop_timeout_secs = 45;
        config.server_args = vec!["nogui".to_string(), "--safeMode".to_string()];
        config.save_to_path(&path).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("toml.tmp").exists());

        let loaded = SupervisorConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.stop_timeout_secs, 45);
        assert_eq!(loaded.server_args, config.server_args);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("warden.toml");
        std::fs::write(&path, "restart_delay_secs = 5\n").unwrap();

        let loaded = SupervisorConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.restart_delay_secs, 5);
        assert_eq!(loaded.shutdown_command, "stop");
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("warden.toml");
        std::fs::write(&path, "stop_timeout_secs = \"soon\"\n").unwrap();

        let result = SupervisorConfig::load_from_path(&path);
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[test]
    fn test_env_var_overrides() {
        let mut config = SupervisorConfig::default();

        unsafe {
            env::set_var(ENV_LAUNCH_PATTERN, "paper-*.jar");
            env::set_var(ENV_CONSOLE_PORT, "5050");
        }

        config.merge_env_vars().unwrap();
        assert_eq!(config.launch_pattern, "paper-*.jar");
        assert_eq!(config.console_port, 5050);

        unsafe {
            env::remove_var(ENV_LAUNCH_PATTERN);
            env::remove_var(ENV_CONSOLE_PORT);
        }
    }

    #[test]
    fn test_invalid_env_var() {
        // Private name so concurrent loads in other tests are unaffected
        const BOGUS: &str = "WARDEN_TEST_BOGUS_TIMEOUT";

        unsafe {
            env::set_var(BOGUS, "forever");
        }

        let result = parse_env::<u64>(BOGUS);
        assert!(matches!(result, Err(WardenError::Config(_))));
        assert!(parse_env::<u64>("WARDEN_TEST_UNSET_VARIABLE").unwrap().is_none());

        unsafe {
            env::remove_var(BOGUS);
        }
    }
}
