use std::panic;
use tracing::{Dispatch, error, level_filters::LevelFilter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    prelude::*,
    registry::Registry,
};

/// Builds the process logger: JSON records with RFC 3339 UTC timestamps,
/// filtered at `level`, written through `writer`.
///
/// Construction cannot fail. The result is not installed anywhere; callers
/// either scope work to it with `WithSubscriber` or pass it to
/// [`install_global`].
pub fn build_logger<W>(level: LevelFilter, writer: W) -> Dispatch
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let json_layer = fmt::layer()
        .json()
        .with_writer(writer)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let subscriber = Registry::default()
        .with(level)
        .with(json_layer)
        .with(ErrorLayer::default());

    Dispatch::new(subscriber)
}

/// Makes `logger` the process-wide default so that threads and tasks outside
/// of the orchestration flow log through it too.
pub fn install_global(logger: &Dispatch) -> Result<(), tracing::dispatcher::SetGlobalDefaultError> {
    tracing::dispatcher::set_global_default(logger.clone())
}

/// Routes panics through the logger as ERROR records.
pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Unknown panic");

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message = %msg,
            location = %location,
            "Application panicked!"
        );
    }));
}
