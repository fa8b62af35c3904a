// Local crates
use crate::metrics::registry::{MetricsError, MetricsRegistry, ROOT_PREFIX, Registerer};

// External crates
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// A component owning instrumentation of its own.
///
/// Each subsystem gets a view prefixed with `<ROOT_PREFIX>_<metrics_prefix>`,
/// so two subsystems with distinct prefixes cannot produce the same name.
pub trait Subsystem: Send + Sync {
    /// Name used when reporting registration failures.
    fn name(&self) -> &'static str;

    /// Namespace segment for this subsystem's metrics.
    fn metrics_prefix(&self) -> &'static str;

    /// Attaches the subsystem's collectors to `registerer`. Called exactly once.
    fn register_metrics(&self, registerer: &Registerer) -> Result<(), MetricsError>;
}

/// Registration failure of one subsystem.
#[derive(Debug, Error)]
#[error("{subsystem}: {cause}")]
pub struct SubsystemError {
    /// Failing subsystem.
    pub subsystem: &'static str,
    /// What went wrong.
    pub cause: MetricsError,
}

/// Every failure of one composition attempt, in subsystem order.
#[derive(Debug, Default)]
pub struct RegistrationErrors {
    errors: Vec<SubsystemError>,
}

impl RegistrationErrors {
    /// Records one more failure.
    pub fn push(&mut self, error: SubsystemError) {
        self.errors.push(error);
    }

    /// Number of failures collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `true` when every attempt succeeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected failures.
    #[must_use]
    pub fn errors(&self) -> &[SubsystemError] {
        &self.errors
    }

    /// `Ok(())` if nothing failed, otherwise the whole collection.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for RegistrationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = if self.errors.len() == 1 { "" } else { "s" };
        write!(
            f,
            "unable to register metrics: {} error{plural} occurred:",
            self.errors.len()
        )?;
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RegistrationErrors {}

impl Extend<SubsystemError> for RegistrationErrors {
    fn extend<T: IntoIterator<Item = SubsystemError>>(&mut self, iter: T) {
        self.errors.extend(iter);
    }
}

/// Builds the process registry.
///
/// Every subsystem is offered its view once, in order, whether or not an
/// earlier one failed. On success the registry is sealed and returned; on any
/// failure it is dropped and all failures are returned together.
#[instrument(
    name = "metrics::compose_registry",
    target = "metrics::compose",
    level = "debug",
    skip_all
)]
pub fn compose_registry(
    subsystems: &[Arc<dyn Subsystem>],
) -> Result<MetricsRegistry, RegistrationErrors> {
    let registry = MetricsRegistry::new();
    let root = registry.wrap_with_prefix(ROOT_PREFIX);
    let mut errors = RegistrationErrors::default();

    for subsystem in subsystems {
        let view = root.wrap_with_prefix(subsystem.metrics_prefix());
        tracing::debug!(
            subsystem = subsystem.name(),
            prefix = view.prefix().unwrap_or_default(),
            "Registering subsystem metrics"
        );

        if let Err(cause) = subsystem.register_metrics(&view) {
            tracing::debug!(
                subsystem = subsystem.name(),
                error = %cause,
                "Subsystem metrics registration failed"
            );
            errors.push(SubsystemError {
                subsystem: subsystem.name(),
                cause,
            });
        }
    }

    errors.into_result()?;
    registry.seal();
    Ok(registry)
}
