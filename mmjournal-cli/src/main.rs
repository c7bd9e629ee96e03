//! mmjournal-cli - offline journal tooling for mmjournal
//!
//! Works directly on a journal directory while the daemon is stopped.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mmjournal-cli")]
#[command(about = "Inspect, verify and replay mmjournal journals")]
#[command(version)]
pub struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List journal files and, optionally, their sections
    Inspect {
        /// Journal directory
        #[arg(env = "MMJOURNAL_JOURNAL_DIR")]
        journal_dir: PathBuf,

        /// Print every section, not just per-file totals
        #[arg(short, long)]
        sections: bool,
    },

    /// Scan the journal the way startup recovery does
    Verify {
        /// Journal directory
        #[arg(env = "MMJOURNAL_JOURNAL_DIR")]
        journal_dir: PathBuf,
    },

    /// Replay the journal into the data files
    Recover {
        /// Data directory
        #[arg(env = "MMJOURNAL_DATA")]
        data_dir: PathBuf,

        /// Journal directory (defaults to <data_dir>/journal)
        #[arg(short, long)]
        journal_dir: Option<PathBuf>,

        /// Keep the journal files after replaying them
        #[arg(long)]
        keep_journal: bool,

        /// Only report what would be replayed
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match commands::execute(cli.command, cli.json) {
        Ok(outcome) => {
            println!("{}", outcome.output);
            std::process::exit(outcome.exit_code);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
