// Local crates
use crate::memlimit::memlimit::MemLimitError;

// External crates
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::instrument;

/// cgroup v1 reports "no limit" as a page-aligned value close to `i64::MAX`.
/// Anything at or above this is treated as unlimited.
const CGROUP_V1_UNLIMITED: u64 = 1 << 62;

/// A source of the memory limit the process should live within.
///
/// `Ok(None)` means the source is reachable but has no usable value, which
/// lets a [`Fallback`] chain move on without treating it as an error.
pub trait LimitProvider: Send + Sync {
    /// Short name used in log records.
    fn name(&self) -> &'static str;

    /// Detected limit in bytes.
    fn limit(&self) -> Result<Option<u64>, MemLimitError>;

    /// Detected limit together with the name of the provider that produced it.
    fn detect(&self) -> Result<Option<(&'static str, u64)>, MemLimitError> {
        Ok(self.limit()?.map(|limit| (self.name(), limit)))
    }
}

/// Reads the memory limit of the cgroup the process belongs to.
#[derive(Debug, Clone)]
pub struct CgroupProvider {
    mount_root: PathBuf,
    proc_self_cgroup: PathBuf,
}

impl Default for CgroupProvider {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/sys/fs/cgroup"),
            proc_self_cgroup: PathBuf::from("/proc/self/cgroup"),
        }
    }
}

impl CgroupProvider {
    /// Provider reading from a custom cgroup mount and membership file.
    pub fn with_paths(mount_root: impl Into<PathBuf>, proc_self_cgroup: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            proc_self_cgroup: proc_self_cgroup.into(),
        }
    }

    /// Candidate limit files, most specific first.
    fn candidates(&self) -> Vec<(PathBuf, CgroupVersion)> {
        let mut candidates = Vec::new();
        let membership = fs::read_to_string(&self.proc_self_cgroup).unwrap_or_default();
        let v1_root = self.mount_root.join("memory");

        if let Some(relative) = unified_cgroup_path(&membership).and_then(nested) {
            candidates.push((
                self.mount_root.join(relative).join("memory.max"),
                CgroupVersion::V2,
            ));
        }
        candidates.push((self.mount_root.join("memory.max"), CgroupVersion::V2));

        if let Some(relative) = memory_controller_path(&membership).and_then(nested) {
            candidates.push((
                v1_root.join(relative).join("memory.limit_in_bytes"),
                CgroupVersion::V1,
            ));
        }
        candidates.push((v1_root.join("memory.limit_in_bytes"), CgroupVersion::V1));
        candidates
    }
}

#[derive(Debug, Clone, Copy)]
enum CgroupVersion {
    V1,
    V2,
}

/// Extracts the path of the cgroup v2 hierarchy (`0::<path>`) from the
/// contents of `/proc/self/cgroup`.
fn unified_cgroup_path(membership: &str) -> Option<&str> {
    membership
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
}

/// Extracts the path of the cgroup v1 memory controller
/// (`<id>:<controllers>:<path>` with `memory` among the controllers).
fn memory_controller_path(membership: &str) -> Option<&str> {
    membership.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        controllers
            .split(',')
            .any(|c| c == "memory")
            .then(|| path.trim())
    })
}

/// Relative form of a cgroup path, `None` for the root.
fn nested(path: &str) -> Option<&str> {
    Some(path.trim_start_matches('/')).filter(|relative| !relative.is_empty())
}

fn parse_limit_file(path: &Path, contents: &str, version: CgroupVersion) -> Result<Option<u64>, MemLimitError> {
    let value = contents.trim();
    if value == "max" {
        return Ok(None);
    }

    let bytes: u64 = value.parse().map_err(|_| MemLimitError::Parse {
        source_name: path.display().to_string(),
        value: value.to_string(),
    })?;

    match version {
        CgroupVersion::V1 if bytes >= CGROUP_V1_UNLIMITED => Ok(None),
        _ if bytes == 0 => Ok(None),
        _ => Ok(Some(bytes)),
    }
}

impl LimitProvider for CgroupProvider {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    #[instrument(
        name = "memlimit::cgroup_provider",
        target = "memlimit::provider",
        level = "trace",
        skip_all
    )]
    fn limit(&self) -> Result<Option<u64>, MemLimitError> {
        for (path, version) in self.candidates() {
            let contents = match fs::read_to_string(&path) {
                Ok(s) => s,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::trace!(path = %path.display(), "cgroup limit file not present");
                    continue;
                }
                Err(e) => {
                    return Err(MemLimitError::Read {
                        path: path.clone(),
                        source: e,
                    });
                }
            };

            let limit = parse_limit_file(&path, &contents, version)?;
            tracing::trace!(
                path = %path.display(),
                limit_bytes = ?limit,
                "Read cgroup memory limit"
            );
            return Ok(limit);
        }

        Ok(None)
    }
}

/// Total physical memory of the host, as reported by `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProvider;

impl LimitProvider for SystemProvider {
    fn name(&self) -> &'static str {
        "system"
    }

    fn limit(&self) -> Result<Option<u64>, MemLimitError> {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        match sys.total_memory() {
            0 => Ok(None),
            total => Ok(Some(total)),
        }
    }
}

/// Ordered provider chain: the first provider yielding a value wins.
pub struct Fallback {
    providers: Vec<Box<dyn LimitProvider>>,
}

impl Fallback {
    /// Chain trying `providers` in order.
    pub fn new(providers: Vec<Box<dyn LimitProvider>>) -> Self {
        Self { providers }
    }
}

impl Default for Fallback {
    /// cgroup first, then the whole system.
    fn default() -> Self {
        Self::new(vec![
            Box::new(CgroupProvider::default()),
            Box::new(SystemProvider),
        ])
    }
}

impl std::fmt::Debug for Fallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.name()))
            .finish()
    }
}

impl LimitProvider for Fallback {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn limit(&self) -> Result<Option<u64>, MemLimitError> {
        Ok(self.detect()?.map(|(_, limit)| limit))
    }

    /// Errors are remembered and the chain moves on; the last one is returned
    /// only if no provider produced a value.
    fn detect(&self) -> Result<Option<(&'static str, u64)>, MemLimitError> {
        let mut last_err = None;

        for provider in &self.providers {
            match provider.detect() {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {
                    tracing::debug!(provider = provider.name(), "No memory limit from provider");
                }
                Err(e) => {
                    tracing::debug!(
                        provider = provider.name(),
                        error = %e,
                        "Memory limit provider failed, trying next"
                    );
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}
