use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the supervised server.
///
/// ```text
/// Stopped ──start──▶ Starting ──spawned──▶ Running ──stop──▶ Stopping ──reaped──▶ Stopped
///    ▲                  │                     │
///    └──spawn failed────┘                     └──exit observed (crash)──▶ Stopped
/// ```
///
/// A crash is only noticed on the next liveness check, so `Running` may be
/// reported briefly for a process that has already exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    /// Whether a process may exist in this state.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
