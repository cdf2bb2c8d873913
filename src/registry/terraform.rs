use std::path::Path;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{host_platform, DownloadInfo, Registry, VersionInfo};
use crate::error::{Error, Result};

/// Public Terraform registry provider API root.
pub const DEFAULT_BASE_URL: &str = "https://registry.terraform.io/v1/providers";

/// Registry client for the Terraform/OpenTofu provider registry protocol.
pub struct TerraformRegistry {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    versions: Vec<VersionInfo>,
}

impl Default for TerraformRegistry {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl TerraformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the client at an alternate registry root, e.g.
    /// `https://registry.opentofu.org/v1/providers` or a test server.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Supply a pre-configured HTTP client (proxies, custom TLS, timeouts).
    pub fn with_http_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Registry for TerraformRegistry {
    async fn get_versions(&self, namespace: &str, name: &str) -> Result<Vec<VersionInfo>> {
        let url = format!("{}/{}/{}/versions", self.base_url, namespace, name);
        debug!(%url, "listing provider versions");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to query provider registry")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::ProviderNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(anyhow!("registry returned status {}", resp.status().as_u16()).into());
        }

        let listing: VersionsResponse = resp
            .json()
            .await
            .context("failed to decode versions response")?;
        Ok(listing.versions)
    }

    async fn get_latest_version(&self, namespace: &str, name: &str) -> Result<String> {
        let mut versions = self.get_versions(namespace, name).await?;
        versions.sort_by_key(|v| semver_key(&v.version));

        match versions.pop() {
            Some(latest) => Ok(latest.version),
            None => Err(Error::ProviderNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn get_download_info(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<DownloadInfo> {
        let (host_os, host_arch) = host_platform();
        let os = if os.is_empty() { host_os } else { os };
        let arch = if arch.is_empty() { host_arch } else { arch };

        let url = format!(
            "{}/{}/{}/{}/download/{}/{}",
            self.base_url, namespace, name, version, os, arch
        );
        debug!(%url, "fetching download info");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to query download info")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::VersionNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(anyhow!(
                "registry returned status {} for download info",
                resp.status().as_u16()
            )
            .into());
        }

        let info = resp
            .json()
            .await
            .context("failed to decode download response")?;
        Ok(info)
    }

    async fn download_to_path(&self, info: &DownloadInfo, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create download directory")?;
        }

        let mut resp = self
            .http
            .get(&info.download_url)
            .send()
            .await
            .context("failed to download provider archive")?;
        if !resp.status().is_success() {
            return Err(anyhow!("download returned status {}", resp.status().as_u16()).into());
        }

        let mut out = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        while let Some(chunk) = resp.chunk().await.context("failed to read archive body")? {
            out.write_all(&chunk)
                .await
                .context("failed to write archive")?;
        }
        out.flush().await.context("failed to flush archive")?;
        Ok(())
    }
}

/// Sort key for provider versions: numeric `(major, minor, patch)`, with a
/// leading `v` stripped and anything from the first `-` or `+` dropped.
/// Unparseable components compare as zero.
fn semver_key(version: &str) -> (u64, u64, u64) {
    let version = version.strip_prefix('v').unwrap_or(version);
    let version = version
        .split_once(['-', '+'])
        .map_or(version, |(core, _)| core);

    let mut parts = version.split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .unwrap_or(0)
    };
    (next(), next(), next())
}
