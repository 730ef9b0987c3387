//! # Warden Core
//!
//! Supervision of a single long-running game server process: start, graceful
//! stop with forced escalation, restart, stdin commands, status, and a
//! crash-tolerant log of everything the server printed or was told.
//!
//! ## Components
//!
//! - [`ProcessSupervisor`] owns the child process and its state machine
//! - [`OutputSink`] records events to an in-memory ring, `logs/unified.log`
//!   and a JSON snapshot used to recover the ring after a restart
//! - [`CommandOutputQueue`] hands out events once to polling clients
//! - [`PortResolver`] checks whether a port is bound and by whom
//!
//! ## Example
//!
//! ```no_run
//! use warden_core::{ProcessSupervisor, SupervisorConfig};
//!
//! # async fn example() {
//! let supervisor = ProcessSupervisor::new(SupervisorConfig::with_data_dir("./data"));
//!
//! let report = supervisor.start().await;
//! println!("{}", report.message);
//!
//! supervisor.send_command("say hello").await;
//! for line in supervisor.tail(Some(10)) {
//!     println!("{}", line);
//! }
//!
//! supervisor.stop().await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod port;
pub mod queue;
pub mod report;
pub mod sink;
pub mod supervisor;
pub mod system;

pub use config::SupervisorConfig;
pub use error::{ErrorCode, Result, WardenError};
pub use event::{EventLevel, OutputEvent};
pub use port::{PortProbe, PortResolver};
pub use queue::CommandOutputQueue;
pub use report::{Report, StatusReport};
pub use sink::{LogCursor, OutputSink};
pub use supervisor::{ProcessSupervisor, SupervisorState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
