use thiserror::Error;

/// Typed failures surfaced by the client. Each variant carries the context
/// needed to pattern-match on the failure without parsing messages; wrapped
/// lower-layer causes ride along as sources.
#[derive(Debug, Error)]
pub enum Error {
    /// The registry has no such provider (404 on the version listing, or an
    /// empty version list when resolving "latest").
    #[error("provider not found: {namespace}/{name}")]
    ProviderNotFound { namespace: String, name: String },

    /// The registry knows the provider but not this version (404 on the
    /// download-info endpoint).
    #[error("version {version} not found for provider {namespace}/{name}")]
    VersionNotFound {
        namespace: String,
        name: String,
        version: String,
    },

    /// Resolving or transferring the provider artifact failed.
    #[error("failed to download provider {namespace}/{name}@{version}")]
    DownloadFailed {
        namespace: String,
        name: String,
        version: String,
        #[source]
        source: anyhow::Error,
    },

    /// The provider subprocess or its handshake failed for a reason other
    /// than a protocol-version mismatch.
    #[error("failed to launch provider {namespace}/{name}@{version}")]
    LaunchFailed {
        namespace: String,
        name: String,
        version: String,
        #[source]
        source: anyhow::Error,
    },

    /// The provider speaks a plugin protocol this client does not support.
    /// Some providers (hashicorp/random among them) still ship protocol 5.
    #[error(
        "provider {namespace}/{name}@{version} uses plugin protocol v{provider_protocol}, \
         but this client only supports protocol v{client_protocol}"
    )]
    ProtocolUnsupported {
        namespace: String,
        name: String,
        version: String,
        provider_protocol: u32,
        client_protocol: u32,
    },

    /// The schema RPC failed, or the provider reported an error diagnostic
    /// alongside its schema.
    #[error("failed to get schema for provider {namespace}/{name}")]
    SchemaFailed {
        namespace: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The configure RPC failed, or the provider rejected the configuration.
    #[error("failed to configure provider {namespace}/{name}")]
    ConfigureFailed {
        namespace: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Reserved for callers that require a configured provider before
    /// reading; the core itself never raises this.
    #[error("provider not configured: {namespace}/{name}")]
    ProviderNotConfigured { namespace: String, name: String },

    /// The requested data source type is absent from the provider schema.
    #[error("data source {type_name:?} not found in provider {namespace}/{name}")]
    DataSourceNotFound {
        type_name: String,
        namespace: String,
        name: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
