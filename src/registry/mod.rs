mod terraform;

pub use terraform::{TerraformRegistry, DEFAULT_BASE_URL};

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// One released provider version as listed by the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub protocols: Vec<String>,
}

/// Download metadata for a specific provider version and platform.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadInfo {
    pub os: String,
    pub arch: String,
    pub filename: String,
    #[serde(rename = "download_url")]
    pub download_url: String,
    #[serde(rename = "shasum")]
    pub sha256: String,
}

/// A provider registry. The default implementation talks to the public
/// Terraform registry; mirrors can be dropped in behind this trait.
#[async_trait]
pub trait Registry: Send + Sync {
    /// All released versions of `namespace/name`, in registry order.
    async fn get_versions(&self, namespace: &str, name: &str) -> Result<Vec<VersionInfo>>;

    /// The highest released version of `namespace/name` by semver order.
    async fn get_latest_version(&self, namespace: &str, name: &str) -> Result<String>;

    /// Download metadata for one version on one platform. Empty `os`/`arch`
    /// default to the host platform.
    async fn get_download_info(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<DownloadInfo>;

    /// Stream the archive behind `info` to `dest`, creating parent
    /// directories as needed.
    async fn download_to_path(&self, info: &DownloadInfo, dest: &Path) -> Result<()>;
}

/// Host platform in registry vocabulary (`linux`/`darwin`/`windows`,
/// `amd64`/`arm64`).
pub fn host_platform() -> (&'static str, &'static str) {
    let os = if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    };

    let arch = if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "amd64"
    };

    (os, arch)
}
