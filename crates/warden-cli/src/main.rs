//! Warden CLI - console for a supervised game server.
//!
//! # Usage
//!
//! ```bash
//! # Start the server and attach an interactive console
//! warden run
//!
//! # Check who holds a port
//! warden probe 25565
//!
//! # Show the last 50 log lines, or poll incrementally
//! warden logs -n 50
//! warden logs --since 0
//!
//! # Terminate stray Java processes
//! warden kill java
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing_appender::non_blocking::WorkerGuard;
use warden_cli::{commands, interactive, output, OutputFormat};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden - supervisor console for a game server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Server data directory (overrides the configuration)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server and attach an interactive console
    Run {
        /// Attach without starting the server
        #[arg(long)]
        no_start: bool,

        /// Terminate a stale instance holding the console port without asking
        #[arg(long)]
        reclaim: bool,
    },

    /// Check whether a port is in use and by which process
    Probe {
        /// Port to check
        port: u16,

        /// Offer to terminate the owning process
        #[arg(long)]
        kill: bool,
    },

    /// Show the server log
    Logs {
        /// Number of lines (default: configured tail length)
        #[arg(short = 'n', long, conflicts_with = "since")]
        lines: Option<usize>,

        /// Print lines after this cursor and the next cursor
        #[arg(long)]
        since: Option<u64>,
    },

    /// Terminate every process whose name contains NAME
    Kill {
        /// Case-insensitive process name fragment
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::error(format!("{:#}", e));
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = OutputFormat::from_flag(cli.json);

    let config_path = commands::resolve_config_path(cli.config);
    let mut config = commands::load_config(&config_path)?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    // The console keeps a file log next to the server log
    let log_dir = matches!(cli.command, Commands::Run { .. }).then(|| config.logs_dir());
    let _guard = init_logging(cli.verbose, log_dir.as_deref());

    match cli.command {
        Commands::Run { no_start, reclaim } => {
            interactive::run_console(config, no_start, reclaim).await?;
        }

        Commands::Probe { port, kill } => {
            commands::probe_port(&config, port, kill, format).await?;
        }

        Commands::Logs { lines, since } => {
            commands::show_logs(&config, lines, since, format)?;
        }

        Commands::Kill { name, yes } => {
            commands::kill_processes(&config, &name, yes, format).await?;
        }

        Commands::Config { write } => {
            commands::show_config(&config, &config_path, write, format)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("warden_core=debug,warden_cli=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warden_core=warn,warden_cli=info,warn"))
    };

    let (file_layer, guard) = match log_dir.map(|dir| (dir, std::fs::create_dir_all(dir))) {
        Some((dir, Ok(()))) => {
            let appender = tracing_appender::rolling::never(dir, "warden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Some((dir, Err(e))) => {
            output::warning(format!("File logging disabled ({}): {}", dir.display(), e));
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}
