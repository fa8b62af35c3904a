// Local crates
use crate::metrics::{MetricsError, Registerer, Subsystem};

// External crates
use anyhow::{Context, Result};
use prometheus::IntCounter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::instrument;
use walkdir::WalkDir;

/// Name of the metadata file every TSDB block directory carries.
pub const BLOCK_META_FILE: &str = "meta.json";

/// Collectors of the block storage layer.
#[derive(Clone)]
pub struct DbMetrics {
    /// Blocks found while scanning a TSDB directory.
    pub blocks_discovered: IntCounter,
    /// Blocks whose metadata could not be read or parsed.
    pub block_meta_errors: IntCounter,
}

impl DbMetrics {
    fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            blocks_discovered: IntCounter::new(
                "blocks_discovered_total",
                "Number of TSDB blocks discovered",
            )?,
            block_meta_errors: IntCounter::new(
                "block_meta_errors_total",
                "Number of TSDB blocks with unreadable metadata",
            )?,
        })
    }
}

impl std::fmt::Debug for DbMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbMetrics")
            .field("blocks_discovered", &self.blocks_discovered.get())
            .field("block_meta_errors", &self.block_meta_errors.get())
            .finish()
    }
}

/// The block storage subsystem. Its collectors exist once registered.
#[derive(Default)]
pub struct DbSubsystem {
    metrics: OnceLock<DbMetrics>,
}

impl DbSubsystem {
    /// Collectors, if [`Subsystem::register_metrics`] succeeded.
    pub fn metrics(&self) -> Option<&DbMetrics> {
        self.metrics.get()
    }
}

impl std::fmt::Debug for DbSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSubsystem")
            .field("registered", &self.metrics.get().is_some())
            .finish()
    }
}

impl Subsystem for DbSubsystem {
    fn name(&self) -> &'static str {
        "db"
    }

    fn metrics_prefix(&self) -> &'static str {
        "db"
    }

    fn register_metrics(&self, registerer: &Registerer) -> Result<(), MetricsError> {
        let metrics = DbMetrics::new()?;
        registerer.register(Box::new(metrics.blocks_discovered.clone()))?;
        registerer.register(Box::new(metrics.block_meta_errors.clone()))?;

        // Only the first successful registration is kept.
        let _ = self.metrics.set(metrics);
        Ok(())
    }
}

/// Time range and identity of a TSDB block, as stored in its `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockMeta {
    /// Block identifier.
    pub ulid: String,
    /// Inclusive start, milliseconds since epoch.
    #[serde(rename = "minTime")]
    pub min_time: i64,
    /// Exclusive end, milliseconds since epoch.
    #[serde(rename = "maxTime")]
    pub max_time: i64,
}

/// Block directories directly under `root`, sorted by name. A directory is a
/// block when it holds a [`BLOCK_META_FILE`].
#[instrument(
    name = "db::discover_blocks",
    target = "db::db",
    level = "debug",
    skip_all,
    fields(root = %root.display())
)]
pub fn discover_blocks(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        anyhow::bail!("TSDB path {:?} is not a directory", root);
    }

    let mut blocks = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("Failed to scan TSDB path {:?}", root))?;
        if entry.file_type().is_dir() && entry.path().join(BLOCK_META_FILE).is_file() {
            blocks.push(entry.into_path());
        }
    }

    tracing::debug!(blocks = blocks.len(), "Discovered TSDB blocks");
    Ok(blocks)
}

/// Reads and parses the metadata of the block at `dir`.
pub async fn read_block_meta(dir: &Path) -> Result<BlockMeta> {
    let path = dir.join(BLOCK_META_FILE);
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read block metadata at {:?}", path))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse block metadata at {:?}", path))
}
