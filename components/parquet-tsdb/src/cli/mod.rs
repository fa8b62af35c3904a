//! Command line schema.

/// Global flags and subcommands.
#[allow(clippy::module_inception)]
pub mod cli;

pub use cli::{Cli, Command, DEFAULT_MEMLIMIT_RATIO, LogLevel, parse_memlimit_ratio};
