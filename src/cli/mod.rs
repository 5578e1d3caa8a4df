//! Command-line interface for swe-harvest.
//!
//! Provides the `collect` command that mines repositories into task-instance
//! files, and the `repos` command for repository discovery.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
