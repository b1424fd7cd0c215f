//! Registry Mirror Daemon
//!
//! Mirrors a package registry into a search index.
//!
//! # Usage
//!
//! ```bash
//! mirror-daemon start [--seed] [--db-path PATH]
//! mirror-daemon status
//! mirror-daemon reset
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/registry-mirror/config.toml)
//! 3. Environment variables (MIRROR_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use mirror_daemon::{reset, show_status, start_daemon, Cli, Commands, Overrides};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut overrides = Overrides {
        config_path: cli.config.as_deref(),
        db_path: cli.db_path.as_deref(),
        log_level: cli.log_level.as_deref(),
        seed: false,
    };

    match cli.command {
        Commands::Start { seed } => {
            overrides.seed = seed;
            start_daemon(overrides).await?;
        }
        Commands::Status => {
            show_status(overrides).await?;
        }
        Commands::Reset => {
            reset(overrides).await?;
        }
    }

    Ok(())
}
