//! Library for the warden CLI: commands, the interactive console and
//! terminal output helpers.

pub mod commands;
pub mod interactive;
pub mod output;

pub use output::OutputFormat;
