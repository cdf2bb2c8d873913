use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::{ArchiveHandle, ArtifactId, Cache, FilesystemCache};
use crate::error::{Error, Result};
use crate::provider::session::{self, ProviderSession};
use crate::registry::{host_platform, Registry, TerraformRegistry};

/// Names a provider to create or stop. An empty `version` means "latest".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRef {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl ProviderRef {
    /// Reference the latest version of `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: String::new(),
        }
    }

    /// Reference a specific version.
    pub fn with_version(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Session key once the version is resolved. Distinct versions of one
    /// provider run as distinct sessions.
    fn key(&self) -> String {
        format!("{}/{}@{}", self.namespace, self.name, self.version)
    }

    /// Version-independent alias, used to resolve "latest" stops.
    fn alias(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Builds a [`Client`] with custom cache or registry backends.
#[derive(Default)]
pub struct ClientBuilder {
    cache: Option<Arc<dyn Cache>>,
    registry: Option<Arc<dyn Registry>>,
    cache_dir: Option<PathBuf>,
}

impl ClientBuilder {
    /// Use a custom cache implementation.
    pub fn cache(mut self, cache: impl Cache + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Use the filesystem cache rooted at `dir`.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Use a custom registry implementation.
    pub fn registry(mut self, registry: impl Registry + 'static) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    pub fn build(self) -> Result<Client> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(TerraformRegistry::new()));

        let cache: Arc<dyn Cache> = match (self.cache, self.cache_dir) {
            (Some(cache), _) => cache,
            (None, Some(dir)) => Arc::new(FilesystemCache::new(dir)),
            (None, None) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| anyhow!("failed to determine home directory"))?;
                Arc::new(FilesystemCache::new(
                    home.join(".tf-data-client").join("providers"),
                ))
            }
        };

        Ok(Client {
            registry,
            cache,
            state: Mutex::new(ClientState::default()),
        })
    }
}

#[derive(Default)]
struct ClientState {
    /// Live sessions keyed by "namespace/name@version".
    sessions: HashMap<String, Arc<ProviderSession>>,
    /// "namespace/name" -> session key, recorded when a version was resolved
    /// from "latest" so an empty-version stop can find the session.
    latest: HashMap<String, String>,
}

/// Orchestrates provider lifecycles: version resolution, artifact caching,
/// subprocess launch, session reuse, and teardown.
///
/// All state transitions happen under one mutex, held across registry,
/// cache, and launch work; concurrent `create_provider` calls for the same
/// resolved provider therefore observe a single session and a single
/// download.
pub struct Client {
    registry: Arc<dyn Registry>,
    cache: Arc<dyn Cache>,
    state: Mutex<ClientState>,
}

impl Client {
    /// A client with the default registry and the default filesystem cache
    /// under `$HOME/.tf-data-client/providers`.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Resolve, download (if missing), launch, and schema-load a provider.
    /// Returns the existing session when one is already live for the
    /// resolved version.
    pub async fn create_provider(&self, provider: &ProviderRef) -> Result<Arc<ProviderSession>> {
        let mut state = self.state.lock().await;

        let mut resolved = provider.clone();
        let was_latest = resolved.version.is_empty();
        if was_latest {
            resolved.version = self
                .registry
                .get_latest_version(&resolved.namespace, &resolved.name)
                .await
                .map_err(|_| Error::ProviderNotFound {
                    namespace: resolved.namespace.clone(),
                    name: resolved.name.clone(),
                })?;
            debug!(
                provider = %resolved.alias(),
                version = %resolved.version,
                "resolved latest version"
            );
        }

        let key = resolved.key();
        if let Some(existing) = state.sessions.get(&key).cloned() {
            debug!(session = %key, "reusing running provider");
            if was_latest {
                state.latest.insert(resolved.alias(), key);
            }
            return Ok(existing);
        }

        let exec_path = self.ensure_artifact(&resolved).await?;

        info!(
            namespace = %resolved.namespace,
            name = %resolved.name,
            version = %resolved.version,
            path = %exec_path.display(),
            "launching provider"
        );
        let launched = session::launch(&exec_path).await.map_err(|err| {
            match session::protocol_mismatch(&err) {
                Some((provider_protocol, client_protocol)) => Error::ProtocolUnsupported {
                    namespace: resolved.namespace.clone(),
                    name: resolved.name.clone(),
                    version: resolved.version.clone(),
                    provider_protocol,
                    client_protocol,
                },
                None => Error::LaunchFailed {
                    namespace: resolved.namespace.clone(),
                    name: resolved.name.clone(),
                    version: resolved.version.clone(),
                    source: err,
                },
            }
        })?;

        let session = launched
            .into_session(&resolved.namespace, &resolved.name, &resolved.version)
            .await
            .map_err(|source| Error::SchemaFailed {
                namespace: resolved.namespace.clone(),
                name: resolved.name.clone(),
                source,
            })?;

        let session = Arc::new(session);
        state.sessions.insert(key.clone(), session.clone());
        if was_latest {
            state.latest.insert(resolved.alias(), key);
        }
        Ok(session)
    }

    /// The cached executable for `provider`, downloading through the
    /// registry when the cache misses.
    async fn ensure_artifact(&self, provider: &ProviderRef) -> Result<PathBuf> {
        let (os, arch) = host_platform();
        let id = ArtifactId {
            namespace: provider.namespace.clone(),
            name: provider.name.clone(),
            version: provider.version.clone(),
            os: os.to_string(),
            arch: arch.to_string(),
        };

        let registry = self.registry.clone();
        let produce_id = id.clone();
        let produce = Box::pin(async move {
            let info = registry
                .get_download_info(
                    &produce_id.namespace,
                    &produce_id.name,
                    &produce_id.version,
                    &produce_id.os,
                    &produce_id.arch,
                )
                .await?;

            let archive = tempfile::Builder::new()
                .prefix("provider-")
                .suffix(".zip")
                .tempfile()
                .context("failed to create download file")?
                .into_temp_path();
            registry.download_to_path(&info, &archive).await?;
            Ok(ArchiveHandle::from_temp(archive))
        });

        self.cache
            .get_or_put(&id, produce)
            .await
            .map_err(|err| match err.downcast::<Error>() {
                // Typed registry failures pass through untouched.
                Ok(typed @ (Error::VersionNotFound { .. } | Error::ProviderNotFound { .. })) => {
                    typed
                }
                Ok(other) => download_failed(provider, anyhow::Error::new(other)),
                Err(err) => download_failed(provider, err),
            })
    }

    /// Stop one provider and forget it. Resolves an empty version through
    /// the latest alias; stopping an absent provider is a no-op.
    pub async fn stop_provider(&self, provider: &ProviderRef) -> Result<()> {
        let mut state = self.state.lock().await;

        let key = if provider.version.is_empty() {
            match state.latest.get(&provider.alias()) {
                Some(key) => key.clone(),
                None => return Ok(()),
            }
        } else {
            provider.key()
        };

        let Some(session) = state.sessions.remove(&key) else {
            return Ok(());
        };
        state.latest.retain(|_, resolved| resolved != &key);
        drop(state);

        info!(session = %key, "stopping provider");
        session.close().await
    }

    /// Stop every running provider. All sessions are closed even if some
    /// fail; the last failure is returned.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let sessions = std::mem::take(&mut state.sessions);
        state.latest.clear();
        drop(state);

        let mut last_err = None;
        for (key, session) in sessions {
            info!(session = %key, "stopping provider");
            if let Err(err) = session.close().await {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn download_failed(provider: &ProviderRef, source: anyhow::Error) -> Error {
    Error::DownloadFailed {
        namespace: provider.namespace.clone(),
        name: provider.name.clone(),
        version: provider.version.clone(),
        source,
    }
}
