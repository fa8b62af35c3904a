//! Query subsystem: its instrumentation and HTTP surface.

/// `/metrics` HTTP endpoint.
pub mod http;
/// The `search` metrics.
#[allow(clippy::module_inception)]
pub mod search;

pub use http::serve_http;
pub use search::{SearchMetrics, SearchSubsystem};
