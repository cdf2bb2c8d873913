use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

use super::ArtifactId;

/// Poll cadence while waiting on a contended lock. Coordination is purely
/// filesystem-based, so there is no notification channel to wait on.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Per-artifact advisory file locks, one lock file per artifact under the
/// cache's `.locks/` directory. Locks are OS advisory locks: a crashed
/// holder releases them on process exit, and every cooperating process must
/// use the same naming scheme.
pub(super) struct Locker {
    locks_dir: PathBuf,
}

impl Locker {
    pub(super) fn new(locks_dir: PathBuf) -> Self {
        Self { locks_dir }
    }

    fn lock_path(&self, id: &ArtifactId) -> PathBuf {
        // Flat naming, with path separators and Windows drive colons
        // replaced so the identifier cannot nest directories.
        let name = format!("{}-{}-{}.lock", id.namespace, id.name, id.version)
            .replace(['/', '\\', ':'], "-");
        self.locks_dir.join(name)
    }

    /// Acquire the exclusive lock for `id`, polling until it is free. The
    /// returned guard holds the lock until dropped; dropping the future
    /// while waiting leaves nothing held.
    pub(super) async fn acquire(&self, id: &ArtifactId) -> Result<LockGuard> {
        std::fs::create_dir_all(&self.locks_dir).context("failed to create locks directory")?;

        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        let contended = fs2::lock_contended_error();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(err) if err.raw_os_error() == contended.raw_os_error() => {
                    debug!(lock = %path.display(), "cache lock contended, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to lock {}", path.display()));
                }
            }
        }
    }
}

/// Holds an exclusive artifact lock; released on drop.
pub(super) struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
