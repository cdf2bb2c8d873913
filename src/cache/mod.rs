mod filesystem;
mod locker;

pub use filesystem::FilesystemCache;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempPath;

/// Uniquely identifies a provider binary artifact. All five fields are
/// required; callers never mix architectures within one cache base.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{} ({}_{})",
            self.namespace, self.name, self.version, self.os, self.arch
        )
    }
}

/// A downloaded provider archive handed to the cache by a producer. When the
/// handle carries a temp-path guard, dropping it deletes the file, so the
/// archive is cleaned up on every exit path including cancellation.
pub struct ArchiveHandle {
    path: PathBuf,
    _cleanup: Option<TempPath>,
}

impl ArchiveHandle {
    /// Wrap an archive the caller manages itself.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _cleanup: None,
        }
    }

    /// Wrap a temporary archive that is deleted when the handle drops.
    pub fn from_temp(path: TempPath) -> Self {
        Self {
            path: path.to_path_buf(),
            _cleanup: Some(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Archive producer passed to [`Cache::get_or_put`]. The future is only
/// awaited after the per-artifact lock is held and a re-check still misses,
/// so at most one producer runs per publication.
pub type ProduceArchive<'a> = Pin<Box<dyn Future<Output = Result<ArchiveHandle>> + Send + 'a>>;

/// Store of extracted provider executables keyed by [`ArtifactId`].
///
/// Implementations must be safe for concurrent use within a process;
/// `get_or_put` must additionally coordinate across processes sharing the
/// same backing store.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Path of the cached executable, or `None` on a miss. A miss is never
    /// an error.
    async fn get(&self, id: &ArtifactId) -> Result<Option<PathBuf>>;

    /// Whether an executable is cached for `id`.
    async fn has(&self, id: &ArtifactId) -> Result<bool>;

    /// Extract `archive` into the canonical location for `id` and return the
    /// executable path.
    async fn put(&self, id: &ArtifactId, archive: &Path) -> Result<PathBuf>;

    /// Return the cached executable for `id`, invoking `produce` to obtain
    /// an archive if (and only if) the cache misses under the lock.
    async fn get_or_put(&self, id: &ArtifactId, produce: ProduceArchive<'_>) -> Result<PathBuf>;
}
