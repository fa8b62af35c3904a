// External crates
use prometheus::{Encoder, Registry, TextEncoder, core::Collector, proto::MetricFamily};
use std::collections::HashSet;
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tracing::instrument;

/// Prefix every metric of the process is exposed under.
pub const ROOT_PREFIX: &str = "cf_metrics";

/// Errors raised while registering or exposing collectors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registration attempted after composition finished.
    #[error("metrics registry is sealed, cannot register under {prefix:?}")]
    Sealed {
        /// Prefix of the view used.
        prefix: String,
    },

    /// The underlying registry refused the collector, e.g. a duplicate name.
    #[error("failed to register collector under {prefix:?}: {cause}")]
    Register {
        /// Prefix of the view used.
        prefix: String,
        /// Error reported by prometheus.
        cause: prometheus::Error,
    },

    /// A collector could not be built.
    #[error("failed to build collector: {0}")]
    Build(prometheus::Error),

    /// Gathered families could not be rendered.
    #[error("failed to encode metrics: {0}")]
    Encode(prometheus::Error),
}

impl From<prometheus::Error> for MetricsError {
    fn from(err: prometheus::Error) -> Self {
        MetricsError::Build(err)
    }
}

/// One prefixed namespace, backed by its own prometheus registry so names
/// from different namespaces never meet.
struct Scope {
    prefix: String,
    registry: Registry,
}

/// Namespaces plus every fully-qualified name exposed across them, so that
/// `db_x` under `cf_metrics` and `x` under `cf_metrics_db` cannot both exist.
#[derive(Default)]
struct Scopes {
    list: Vec<Scope>,
    exposed: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    scopes: RwLock<Scopes>,
    sealed: AtomicBool,
}

/// Root of the metrics hierarchy.
///
/// Cheap to clone: clones share the same collectors. Collectors are only ever
/// added, never removed, and only until [`MetricsRegistry::seal`] is called.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scopes = self.inner.scopes.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("MetricsRegistry")
            .field(
                "prefixes",
                &scopes.list.iter().map(|s| s.prefix.as_str()).collect::<Vec<_>>(),
            )
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl MetricsRegistry {
    /// Empty, unsealed registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// View registering collectors without any prefix.
    #[must_use]
    pub fn registerer(&self) -> Registerer {
        Registerer {
            registry: self.clone(),
            prefix: None,
        }
    }

    /// View registering collectors under `prefix`.
    #[must_use]
    pub fn wrap_with_prefix(&self, prefix: &str) -> Registerer {
        self.registerer().wrap_with_prefix(prefix)
    }

    /// Rejects every further registration.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
    }

    /// Whether [`MetricsRegistry::seal`] was called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Collects every family, namespaces in the order they were first used.
    #[must_use]
    pub fn gather(&self) -> Vec<MetricFamily> {
        let scopes = self.inner.scopes.read().unwrap_or_else(|e| e.into_inner());
        scopes.list.iter().flat_map(|s| s.registry.gather()).collect()
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), MetricsError> {
        TextEncoder::new()
            .encode(&self.gather(), buffer)
            .map_err(MetricsError::Encode)
    }

    #[instrument(
        name = "metrics::register",
        target = "metrics::registry",
        level = "trace",
        skip(self, collector)
    )]
    fn register(&self, prefix: &str, collector: Box<dyn Collector>) -> Result<(), MetricsError> {
        let mut scopes = self.inner.scopes.write().unwrap_or_else(|e| e.into_inner());

        if self.is_sealed() {
            return Err(MetricsError::Sealed {
                prefix: prefix.to_string(),
            });
        }

        let names: Vec<String> = collector
            .desc()
            .iter()
            .map(|desc| qualified_name(prefix, &desc.fq_name))
            .collect();
        if let Some(taken) = names.iter().find(|name| scopes.exposed.contains(*name)) {
            tracing::debug!(name = %taken, "Metric name already exposed");
            return Err(MetricsError::Register {
                prefix: prefix.to_string(),
                cause: prometheus::Error::AlreadyReg,
            });
        }

        let position = match scopes.list.iter().position(|s| s.prefix == prefix) {
            Some(position) => position,
            None => {
                let registry = if prefix.is_empty() {
                    Registry::new()
                } else {
                    Registry::new_custom(Some(prefix.to_string()), None).map_err(|cause| {
                        MetricsError::Register {
                            prefix: prefix.to_string(),
                            cause,
                        }
                    })?
                };
                tracing::trace!("Created metrics namespace");
                scopes.list.push(Scope {
                    prefix: prefix.to_string(),
                    registry,
                });
                scopes.list.len() - 1
            }
        };

        scopes.list[position]
            .registry
            .register(collector)
            .map_err(|cause| MetricsError::Register {
                prefix: prefix.to_string(),
                cause,
            })?;
        scopes.exposed.extend(names);
        Ok(())
    }
}

fn qualified_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}_{name}")
    }
}

/// Namespaced view onto a [`MetricsRegistry`].
///
/// Names registered through a view are exposed as `<prefix>_<name>`.
#[derive(Debug, Clone)]
pub struct Registerer {
    registry: MetricsRegistry,
    prefix: Option<String>,
}

impl Registerer {
    /// Nested view; segments are joined with `_`.
    #[must_use]
    pub fn wrap_with_prefix(&self, segment: &str) -> Registerer {
        let segment = segment.trim_matches('_');
        let prefix = match (&self.prefix, segment.is_empty()) {
            (prefix, true) => prefix.clone(),
            (Some(prefix), false) => Some(format!("{prefix}_{segment}")),
            (None, false) => Some(segment.to_string()),
        };

        Registerer {
            registry: self.registry.clone(),
            prefix,
        }
    }

    /// Full prefix of this view.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Adds `collector` under this view's prefix.
    pub fn register(&self, collector: Box<dyn Collector>) -> Result<(), MetricsError> {
        self.registry
            .register(self.prefix.as_deref().unwrap_or_default(), collector)
    }
}
