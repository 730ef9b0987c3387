//! Error types for the server supervisor.
//!
//! # Error Taxonomy
//!
//! ```text
//! WardenError
//! ├── AlreadyRunning / NotRunning     precondition violations, no state change
//! ├── EmptyCommand                    blank stdin command
//! ├── LaunchArtifactMissing           no launch jar in the data directory
//! ├── ChildSpawnFailed                the OS refused to create the process
//! ├── PortInUse                       the server port is bound by someone else
//! ├── CommandWrite                    writing to the child's stdin failed
//! ├── InvalidInput / Config           caller or configuration mistakes
//! └── Io / Serialization              wrapped lower-level failures
//! ```
//!
//! Shutdown timeouts, durability write failures and inconclusive port probes
//! are deliberately absent: they never fail an operation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Main error type for the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// A start was requested while a server process is alive
    #[error("Server is already running")]
    AlreadyRunning,

    /// A stop or command was requested with no live server process
    #[error("Server is not running")]
    NotRunning,

    /// A command was blank after trimming
    #[error("Command is empty")]
    EmptyCommand,

    /// No file in the data directory matches the launch pattern
    #[error("Launch artifact missing: no file matching '{pattern}' in {}", .dir.display())]
    LaunchArtifactMissing { pattern: String, dir: PathBuf },

    /// The child process could not be created
    #[error("Failed to spawn '{program}': {source}")]
    ChildSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The server port is already bound
    #[error("Port {port} is already in use{}", .owner.map(|pid| format!(" by PID {pid}")).unwrap_or_default())]
    PortInUse { port: u16, owner: Option<u32> },

    /// Writing to the child's stdin failed
    #[error("Failed to send command: {0}")]
    CommandWrite(#[source] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WardenError {
    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a spawn failure for `program`
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::ChildSpawnFailed {
            program: program.into(),
            source,
        }
    }

    /// Stable, machine-readable kind of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyRunning => ErrorCode::AlreadyRunning,
            Self::NotRunning => ErrorCode::NotRunning,
            Self::EmptyCommand => ErrorCode::EmptyCommand,
            Self::LaunchArtifactMissing { .. } => ErrorCode::LaunchArtifactMissing,
            Self::ChildSpawnFailed { .. } => ErrorCode::ChildSpawnFailed,
            Self::PortInUse { .. } => ErrorCode::PortInUse,
            Self::CommandWrite(_) => ErrorCode::CommandWriteFailed,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Config(_) => ErrorCode::Config,
            Self::Io(_) | Self::Serialization(_) => ErrorCode::Internal,
        }
    }

    /// Check if this error is a precondition violation (nothing was attempted)
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::NotRunning | Self::EmptyCommand
        )
    }
}

/// Serializable failure kind carried in a [`Report`](crate::report::Report).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyRunning,
    NotRunning,
    EmptyCommand,
    LaunchArtifactMissing,
    ChildSpawnFailed,
    PortInUse,
    CommandWriteFailed,
    InvalidInput,
    Config,
    Internal,
}
