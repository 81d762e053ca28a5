//! Verdant CLI
//!
//! Maintenance tools for the on-device mutation journal.
//!
//! # Commands
//!
//! - `inspect` - List queued writes with their status and last error
//! - `retry` - Return a parked or failed write to Pending
//! - `discard` - Drop a queued write
//! - `compact` - Rewrite the journal to hold only live records

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Verdant mutation journal tools.
#[derive(Parser)]
#[command(name = "verdant")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal file
    #[arg(global = true, short, long)]
    journal: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List queued writes
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Return a parked or failed write to Pending
    Retry {
        /// Mutation id
        id: String,
    },

    /// Drop a queued write that is not in flight
    Discard {
        /// Mutation id
        id: String,
    },

    /// Rewrite the journal to hold only live records
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.journal.ok_or("Journal path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Retry { id } => {
            let path = cli.journal.ok_or("Journal path required for retry")?;
            commands::retry::run(&path, &id)?;
        }
        Commands::Discard { id } => {
            let path = cli.journal.ok_or("Journal path required for discard")?;
            commands::discard::run(&path, &id)?;
        }
        Commands::Compact => {
            let path = cli.journal.ok_or("Journal path required for compact")?;
            commands::compact::run(&path)?;
        }
        Commands::Version => {
            println!("Verdant CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Verdant Core v{}", verdant_core::VERSION);
            println!("Journal format v{}", verdant_core::JOURNAL_VERSION);
        }
    }

    Ok(())
}
