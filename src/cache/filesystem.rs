use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::locker::Locker;
use super::{ArtifactId, Cache, ProduceArchive};

/// Filesystem-backed provider cache.
///
/// Layout under the base directory:
///   <base>/<namespace>/<name>/<version>/terraform-provider-<name>...
///   <base>/.locks/<namespace>-<name>-<version>.lock
///   <base>/.tmp/<random-hex>/            (staging, ephemeral)
///
/// Entries are published by renaming a fully-extracted staging directory
/// onto the canonical path, so readers never observe a partial entry.
pub struct FilesystemCache {
    base_dir: PathBuf,
    locker: Locker,
}

impl FilesystemCache {
    pub fn new(base_dir: PathBuf) -> Self {
        let locker = Locker::new(base_dir.join(".locks"));
        Self { base_dir, locker }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn artifact_dir(&self, id: &ArtifactId) -> PathBuf {
        self.base_dir
            .join(&id.namespace)
            .join(&id.name)
            .join(&id.version)
    }

    fn lookup(&self, id: &ArtifactId) -> Option<PathBuf> {
        let path = find_executable(&self.artifact_dir(id), &id.name)?;
        // Only report a hit for a stat-able file.
        std::fs::metadata(&path).ok().map(|_| path)
    }

    /// Extract, locate, and chmod under `dir`; shared by `put` (in place)
    /// and `get_or_put` (staging).
    fn extract_and_prepare(&self, id: &ArtifactId, archive: &Path, dir: &Path) -> Result<PathBuf> {
        extract_zip(archive, dir).context("failed to extract provider archive")?;

        let exec_path = find_executable(dir, &id.name)
            .with_context(|| format!("no provider executable found in archive for {id}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exec_path, std::fs::Permissions::from_mode(0o755))
                .context("failed to mark provider executable")?;
        }

        Ok(exec_path)
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn get(&self, id: &ArtifactId) -> Result<Option<PathBuf>> {
        Ok(self.lookup(id))
    }

    async fn has(&self, id: &ArtifactId) -> Result<bool> {
        Ok(self.lookup(id).is_some())
    }

    async fn put(&self, id: &ArtifactId, archive: &Path) -> Result<PathBuf> {
        let dir = self.artifact_dir(id);
        std::fs::create_dir_all(&dir).context("failed to create cache directory")?;
        self.extract_and_prepare(id, archive, &dir)
    }

    async fn get_or_put(&self, id: &ArtifactId, produce: ProduceArchive<'_>) -> Result<PathBuf> {
        let _lock = self
            .locker
            .acquire(id)
            .await
            .context("failed to acquire cache lock")?;

        // Another process may have populated the entry while we waited.
        if let Some(path) = self.lookup(id) {
            debug!(artifact = %id, path = %path.display(), "cache hit under lock");
            return Ok(path);
        }

        let archive = produce.await?;

        // Extract into a fresh staging directory so a failure part-way
        // through never touches the canonical path.
        let staging = StagingDir::create(&self.base_dir)?;
        self.extract_and_prepare(id, archive.path(), staging.path())?;

        let final_dir = self.artifact_dir(id);
        if let Some(parent) = final_dir.parent() {
            std::fs::create_dir_all(parent).context("failed to create cache directory")?;
        }
        staging
            .publish(&final_dir)
            .context("failed to move provider into cache")?;

        let exec_path = find_executable(&final_dir, &id.name)
            .with_context(|| format!("provider executable missing after publish for {id}"))?;
        info!(artifact = %id, path = %exec_path.display(), "cached provider");
        Ok(exec_path)
    }
}

/// A unique staging directory under `<base>/.tmp/`. Removed on drop unless
/// it was published, so cancellation and error paths leave no residue.
struct StagingDir {
    path: Option<PathBuf>,
}

impl StagingDir {
    fn create(base_dir: &Path) -> Result<Self> {
        let tmp_base = base_dir.join(".tmp");
        std::fs::create_dir_all(&tmp_base).context("failed to create staging area")?;

        let path = tmp_base.join(format!("{:016x}", rand::random::<u64>()));
        std::fs::create_dir(&path).context("failed to create staging directory")?;
        Ok(Self { path: Some(path) })
    }

    fn path(&self) -> &Path {
        self.path.as_deref().expect("staging directory consumed")
    }

    /// Atomically rename the staging directory onto `dest`.
    fn publish(mut self, dest: &Path) -> std::io::Result<()> {
        let path = self.path.take().expect("staging directory consumed");
        std::fs::rename(&path, dest).inspect_err(|_| {
            let _ = std::fs::remove_dir_all(&path);
        })
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_dir_all(path);
        }
    }
}

/// Find the provider executable in `dir`: the first entry whose name starts
/// with `terraform-provider-<name>`.
fn find_executable(dir: &Path, name: &str) -> Option<PathBuf> {
    let prefix = format!("terraform-provider-{name}");
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Some(entry.path());
        }
    }
    None
}

/// Extract a zip archive into `dest`. Every entry must resolve inside
/// `dest` (zip-slip guard); symlinks and other non-regular entries are
/// rejected. File entries keep their stored mode.
fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("failed to read zip archive")?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("failed to read zip entry")?;

        let Some(rel_path) = entry.enclosed_name() else {
            bail!(
                "archive entry {:?} resolves outside the extraction directory",
                entry.name()
            );
        };
        let out_path = dest.join(rel_path);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).context("failed to create directory")?;
            continue;
        }

        let mode = entry.unix_mode();
        if let Some(mode) = mode {
            // Provider archives carry only regular files and directories.
            if mode & 0o170000 == 0o120000 {
                bail!("archive entry {:?} is a symlink", entry.name());
            }
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create directory")?;
        }

        let mut out_file =
            std::fs::File::create(&out_path).context("failed to create extracted file")?;
        std::io::copy(&mut entry, &mut out_file).context("failed to extract file")?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}
