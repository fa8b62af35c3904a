// Local crates
use crate::memlimit::provider::{Fallback, LimitProvider};

// External crates
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::instrument;

/// Environment variable holding an explicit memory ceiling. When set it is
/// applied as-is and the provider chain is not consulted.
pub const MEMLIMIT_ENV: &str = "PARQUET_TSDB_MEMLIMIT";

/// Process-wide soft ceiling in bytes, `0` while unset.
static SOFT_LIMIT: AtomicU64 = AtomicU64::new(0);

/// Failures while detecting or applying the memory ceiling. None of them are
/// fatal to the process.
#[derive(Debug, Error)]
pub enum MemLimitError {
    /// A limit file exists but could not be read.
    #[error("failed to read memory limit from {path:?}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A limit source held something that is not a byte count.
    #[error("invalid memory limit {value:?} in {source_name}")]
    Parse {
        /// Where the value came from.
        source_name: String,
        /// Offending value.
        value: String,
    },

    /// No provider in the chain produced a usable limit.
    #[error("no memory limit detected")]
    NoLimitDetected,

    /// `ratio × limit` rounded down to nothing.
    #[error("memory ceiling of ratio {ratio} over {limit} bytes is zero")]
    ZeroCeiling {
        /// Configured ratio.
        ratio: f64,
        /// Detected limit in bytes.
        limit: u64,
    },
}

/// Where the applied ceiling came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    /// [`MEMLIMIT_ENV`].
    Environment,
    /// A provider of the detection chain, by name.
    Provider(&'static str),
}

/// Result of a successful application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedLimit {
    /// Soft ceiling now in effect.
    pub ceiling_bytes: u64,
    /// Limit the ceiling was derived from.
    pub limit_bytes: u64,
    /// Origin of `limit_bytes`.
    pub source: LimitSource,
}

/// Destination of the computed ceiling.
pub trait LimitSink: Send + Sync {
    /// Makes `ceiling` the process soft limit, returning the previous one.
    fn apply(&self, ceiling: u64) -> Result<Option<u64>, MemLimitError>;
}

/// The process-wide soft limit read back through [`soft_limit`].
///
/// Memory-hungry subsystems consult it to shed caches and buffers before the
/// hard limit of the container or host is reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSoftLimit;

impl LimitSink for ProcessSoftLimit {
    fn apply(&self, ceiling: u64) -> Result<Option<u64>, MemLimitError> {
        let previous = SOFT_LIMIT.swap(ceiling, Ordering::SeqCst);
        Ok((previous != 0).then_some(previous))
    }
}

/// Soft memory ceiling in bytes, if one has been applied.
#[must_use]
pub fn soft_limit() -> Option<u64> {
    match SOFT_LIMIT.load(Ordering::SeqCst) {
        0 => None,
        limit => Some(limit),
    }
}

/// `floor(ratio × limit)`.
#[must_use]
pub fn compute_ceiling(ratio: f64, limit: u64) -> u64 {
    (limit as f64 * ratio).floor() as u64
}

/// Parses a byte count with an optional binary (`KiB`..`TiB`) or decimal
/// (`KB`..`TB`) suffix, e.g. `"512MiB"` or `"2GB"`.
pub fn parse_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let number: u64 = digits.parse().ok()?;

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => return None,
    };

    number.checked_mul(multiplier)
}

/// Computes and applies the soft memory ceiling.
///
/// The ratio is expected to be validated already (finite, in `(0, 1]`).
pub struct MemLimitConfigurator {
    ratio: f64,
    env_override: Option<String>,
    provider: Box<dyn LimitProvider>,
    sink: Box<dyn LimitSink>,
}

impl std::fmt::Debug for MemLimitConfigurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemLimitConfigurator")
            .field("ratio", &self.ratio)
            .field("env_override", &self.env_override)
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl MemLimitConfigurator {
    /// Configurator with the default cgroup → system chain, the process soft
    /// limit as sink and [`MEMLIMIT_ENV`] read from the environment.
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            env_override: std::env::var(MEMLIMIT_ENV).ok(),
            provider: Box::new(Fallback::default()),
            sink: Box::new(ProcessSoftLimit),
        }
    }

    /// Replaces the detection chain.
    pub fn with_provider(mut self, provider: impl LimitProvider + 'static) -> Self {
        self.provider = Box::new(provider);
        self
    }

    /// Replaces the sink the ceiling is applied to.
    pub fn with_sink(mut self, sink: impl LimitSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Overrides what was read from [`MEMLIMIT_ENV`].
    pub fn with_env_override(mut self, value: Option<String>) -> Self {
        self.env_override = value;
        self
    }

    /// Configured ratio.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Detects the limit, computes the ceiling and hands it to the sink.
    #[instrument(
        name = "memlimit::apply",
        target = "memlimit::memlimit",
        level = "debug",
        skip_all,
        fields(ratio = self.ratio)
    )]
    pub fn apply(&self) -> Result<AppliedLimit, MemLimitError> {
        let (ceiling, limit, source) = match self.env_override.as_deref() {
            Some(raw) => {
                let bytes = parse_bytes(raw).ok_or_else(|| MemLimitError::Parse {
                    source_name: MEMLIMIT_ENV.to_string(),
                    value: raw.to_string(),
                })?;
                tracing::debug!(limit_bytes = bytes, "Memory limit taken from environment");
                (bytes, bytes, LimitSource::Environment)
            }
            None => {
                let (provider, limit) = self
                    .provider
                    .detect()?
                    .ok_or(MemLimitError::NoLimitDetected)?;
                (
                    compute_ceiling(self.ratio, limit),
                    limit,
                    LimitSource::Provider(provider),
                )
            }
        };

        if ceiling == 0 {
            return Err(MemLimitError::ZeroCeiling {
                ratio: self.ratio,
                limit,
            });
        }

        let previous = self.sink.apply(ceiling)?;
        tracing::trace!(previous_bytes = ?previous, "Replaced soft memory limit");

        Ok(AppliedLimit {
            ceiling_bytes: ceiling,
            limit_bytes: limit,
            source,
        })
    }
}

/// Applies the memory ceiling, logging the outcome. Failure is reported and
/// swallowed: the process carries on under whatever limit already applies.
pub fn configure_memory_limit(configurator: &MemLimitConfigurator) -> Option<AppliedLimit> {
    match configurator.apply() {
        Ok(applied) => {
            tracing::info!(
                ceiling_bytes = applied.ceiling_bytes,
                limit_bytes = applied.limit_bytes,
                ratio = configurator.ratio(),
                provider = ?applied.source,
                "Applied soft memory limit"
            );
            Some(applied)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                ratio = configurator.ratio(),
                "Could not apply memory limit, continuing without it"
            );
            None
        }
    }
}
