//! Berth — operator shell over the session and port registry.
//!
//! # Usage
//!
//! ```text
//! berth session add [<id>] [--project <path>] [--dir <path>] [--branch <name>]
//!                   [--mode docker|native] [--in-place]
//! berth session list [--project <path>] [--json]
//! berth session show <id> [--json]
//! berth session destroy <id> [--project <path>] [--purge]
//! berth session purge
//! berth session next-id
//! berth ports allocate <id> <service>... [--json]
//! berth ports list [--session <id>] [--json]
//! berth reserve add <port> [--reason <text>]
//! berth reserve remove <port>
//! berth reserve list [--json]
//! ```
//!
//! Every command accepts `--store <path>` to bypass `~/.berth/config.yaml`.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{ports::PortsCommand, reserve::ReserveCommand, session::SessionCommand};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "berth",
    version,
    about = "Track dev sessions and the host ports they hold",
    long_about = None,
)]
struct Cli {
    /// Registry database to use instead of the configured one.
    #[arg(long, global = true, value_name = "PATH")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register, inspect, and retire sessions.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Allocate and list per-service ports.
    Ports {
        #[command(subcommand)]
        command: PortsCommand,
    },

    /// Withhold ports from automatic allocation.
    Reserve {
        #[command(subcommand)]
        command: ReserveCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = cli.store.as_deref();
    match cli.command {
        Commands::Session { command } => commands::session::run(command, store),
        Commands::Ports { command } => commands::ports::run(command, store),
        Commands::Reserve { command } => commands::reserve::run(command, store),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
