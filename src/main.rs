//! Braid - git-backed issue tracking with background sync

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "braid", version, about = "Git-backed issue tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background sync daemon
    Daemon {
        #[command(subcommand)]
        command: braid::daemon::DaemonCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon { command } => braid::daemon::run(command),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
