//! Process orchestration: parse, configure, dispatch one command.

/// Handlers, dispatcher states and the `App`.
#[allow(clippy::module_inception)]
pub mod runtime;

pub use runtime::{
    App, ConvertHandler, DispatchState, FAILURE_EXIT_CODE, Outcome, ServeHandler,
};
