// Local crates
use crate::{
    db::{DbSubsystem, discover_blocks, read_block_meta},
    helpers::shutdown::LifecycleContext,
    runtime::ConvertHandler,
};

// External crates
use anyhow::{Context, Result};
use clap::Args;
use std::{path::PathBuf, sync::Arc};
use tracing::{Instrument, Span};

/// Options of the `convert` command.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct ConvertArgs {
    /// Directory holding the TSDB blocks to convert
    #[arg(long = "tsdb.path", value_name = "DIR")]
    pub tsdb_path: PathBuf,
}

/// Plans the conversion of every block under `--tsdb.path`.
///
/// Parquet output is not produced yet: each readable block is counted and
/// logged, unreadable ones are skipped with a warning.
#[derive(Debug, Clone)]
pub struct Converter {
    db: Arc<DbSubsystem>,
}

impl Converter {
    /// Converter counting into the metrics of `db`.
    pub fn new(db: Arc<DbSubsystem>) -> Self {
        Self { db }
    }

    async fn plan(&self, ctx: LifecycleContext, args: ConvertArgs) -> Result<usize> {
        let root = args.tsdb_path.clone();
        // Blocking threads do not inherit the scoped logger.
        let dispatch = tracing::dispatcher::get_default(Clone::clone);
        let span = Span::current();
        let blocks = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                span.in_scope(|| discover_blocks(&root))
            })
        })
        .await
        .context("Block discovery task failed")??;

        let total = blocks.len();
        if total == 0 {
            tracing::warn!(tsdb_path = %args.tsdb_path.display(), "No TSDB blocks found");
        }

        let mut planned = 0;
        for (index, dir) in blocks.into_iter().enumerate() {
            if ctx.is_cancelled() {
                anyhow::bail!("conversion cancelled after {index} of {total} blocks");
            }

            match read_block_meta(&dir).await {
                Ok(meta) => {
                    if let Some(metrics) = self.db.metrics() {
                        metrics.blocks_discovered.inc();
                    }
                    tracing::info!(
                        ulid = %meta.ulid,
                        min_time = meta.min_time,
                        max_time = meta.max_time,
                        "Planned block conversion"
                    );
                    planned += 1;
                }
                Err(err) => {
                    if let Some(metrics) = self.db.metrics() {
                        metrics.block_meta_errors.inc();
                    }
                    tracing::warn!(
                        block = %dir.display(),
                        error = %format!("{err:#}"),
                        "Skipping block with unreadable metadata"
                    );
                }
            }
        }

        Ok(planned)
    }
}

impl ConvertHandler for Converter {
    async fn convert(&self, ctx: LifecycleContext, span: Span, args: ConvertArgs) -> Result<()> {
        async {
            let planned = self.plan(ctx, args).await?;
            tracing::info!(blocks = planned, "Conversion plan complete");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
