//! Soft memory ceiling derived from the environment, the cgroup or the host.

/// Ceiling computation and application.
#[allow(clippy::module_inception)]
pub mod memlimit;
/// Sources of the memory limit.
pub mod provider;

pub use memlimit::{
    AppliedLimit, LimitSink, LimitSource, MEMLIMIT_ENV, MemLimitConfigurator, MemLimitError,
    ProcessSoftLimit, configure_memory_limit, soft_limit,
};
pub use provider::{CgroupProvider, Fallback, LimitProvider, SystemProvider};
