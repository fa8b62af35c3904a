//! Process lifecycle helpers.

/// Lifecycle context and the shutdown signal bridge.
pub mod shutdown;
