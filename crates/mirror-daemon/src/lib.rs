//! Mirror daemon library exports.
//!
//! This crate provides the CLI daemon binary for the registry mirror.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (start, status, reset)
//! - `pipeline`: Component wiring and shutdown supervision

pub mod cli;
pub mod commands;
pub mod pipeline;

pub use cli::{Cli, Commands};
pub use commands::{
    load_settings, read_status, reset, reset_checkpoint, show_status, start_daemon, Overrides,
    StatusReport,
};
pub use pipeline::{Collaborators, Exit, Pipeline};
