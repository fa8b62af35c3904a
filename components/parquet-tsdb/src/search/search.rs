// Local crates
use crate::metrics::{MetricsError, Registerer, Subsystem};

// External crates
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts};
use std::sync::OnceLock;
use std::time::Duration;

/// Collectors of the query surface.
#[derive(Clone)]
pub struct SearchMetrics {
    /// Requests served, by path and status code.
    pub http_requests: IntCounterVec,
    /// Time spent answering requests.
    pub http_request_duration: Histogram,
}

impl SearchMetrics {
    fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            http_requests: IntCounterVec::new(
                Opts::new("http_requests_total", "Number of HTTP requests served"),
                &["path", "code"],
            )?,
            http_request_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "http_request_duration_seconds",
                    "Histogram of HTTP request durations in seconds",
                )
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            )?,
        })
    }

    /// Records one answered request.
    pub fn observe(&self, path: &str, code: u16, elapsed: Duration) {
        self.http_requests
            .with_label_values(&[path, code.to_string().as_str()])
            .inc();
        self.http_request_duration.observe(elapsed.as_secs_f64());
    }
}

impl std::fmt::Debug for SearchMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchMetrics")
            .field(
                "observed_requests",
                &self.http_request_duration.get_sample_count(),
            )
            .finish_non_exhaustive()
    }
}

/// The query subsystem. Its collectors exist once registered.
#[derive(Default)]
pub struct SearchSubsystem {
    metrics: OnceLock<SearchMetrics>,
}

impl SearchSubsystem {
    /// Collectors, if [`Subsystem::register_metrics`] succeeded.
    pub fn metrics(&self) -> Option<&SearchMetrics> {
        self.metrics.get()
    }
}

impl std::fmt::Debug for SearchSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSubsystem")
            .field("registered", &self.metrics.get().is_some())
            .finish()
    }
}

impl Subsystem for SearchSubsystem {
    fn name(&self) -> &'static str {
        "search"
    }

    fn metrics_prefix(&self) -> &'static str {
        "search"
    }

    fn register_metrics(&self, registerer: &Registerer) -> Result<(), MetricsError> {
        let metrics = SearchMetrics::new()?;
        registerer.register(Box::new(metrics.http_requests.clone()))?;
        registerer.register(Box::new(metrics.http_request_duration.clone()))?;

        let _ = self.metrics.set(metrics);
        Ok(())
    }
}
