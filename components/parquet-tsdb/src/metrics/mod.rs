//! Hierarchical metrics registry and its composition from subsystems.

/// Registration of every subsystem into one registry.
pub mod compose;
/// Prefixed registry and its views.
pub mod registry;

pub use compose::{RegistrationErrors, Subsystem, SubsystemError, compose_registry};
pub use registry::{MetricsError, MetricsRegistry, ROOT_PREFIX, Registerer};
