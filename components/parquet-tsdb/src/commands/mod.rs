//! Handlers of the two commands and their options.

/// The `convert` command.
pub mod convert;
/// The `serve` command.
pub mod serve;

pub use convert::{ConvertArgs, Converter};
pub use serve::{DEFAULT_HTTP_ADDRESS, ServeArgs, Server};
