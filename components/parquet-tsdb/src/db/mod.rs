//! Block storage subsystem.

/// Block discovery and the `db` metrics.
#[allow(clippy::module_inception)]
pub mod db;

pub use db::{BLOCK_META_FILE, BlockMeta, DbMetrics, DbSubsystem, discover_blocks, read_block_meta};
