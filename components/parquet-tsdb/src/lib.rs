//! Process core of `parquet-tsdb`, a TSDB stored in parquet.
//!
//! [`runtime::App`] parses the command line, builds the JSON logger, applies a
//! soft memory ceiling, composes the metrics registry from the
//! [`metrics::Subsystem`]s it was given, bridges shutdown signals into a
//! [`helpers::shutdown::LifecycleContext`] and hands control to the handler of
//! the selected command.

pub mod cli;
pub mod commands;
pub mod db;
pub mod helpers;
pub mod instrumentation;
pub mod memlimit;
pub mod metrics;
pub mod runtime;
pub mod search;
