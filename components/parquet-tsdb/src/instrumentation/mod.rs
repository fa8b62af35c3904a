//! Structured logging for the whole process.

/// JSON logger construction and the panic hook.
pub mod tracing;

pub use self::tracing::{build_logger, init_panic_handler, install_global};
