//! CLI argument parsing for the mirror daemon.
//!
//! CLI flags override every other configuration source.

use clap::{Parser, Subcommand};

/// Registry Mirror Daemon
///
/// Mirrors a package registry into a search index: one resumable bootstrap,
/// then an ordered follow of the change feed.
#[derive(Parser, Debug)]
#[command(name = "mirror-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/registry-mirror/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline until interrupted
    Start {
        /// Discard the checkpoint and bootstrap from scratch
        #[arg(long)]
        seed: bool,
    },

    /// Print the checkpoint and bookkeeping counts
    Status,

    /// Write the zero checkpoint; the next start bootstraps again
    Reset,
}
