use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde_json::Value as Json;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::{debug, info, warn};

use super::codec;
use super::tfplugin6;
use super::tfplugin6::provider_client::ProviderClient;
use crate::error::Error;

/// The go-plugin handshake magic cookie shared by Terraform and OpenTofu.
const MAGIC_COOKIE_KEY: &str = "TF_PLUGIN_MAGIC_COOKIE";
const MAGIC_COOKIE_VALUE: &str = "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

/// The only plugin protocol this client speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 6;

/// Nominal Terraform version reported on configure; providers do not gate
/// data-source reads on it.
const TERRAFORM_VERSION: &str = "1.0.0";

/// Name both ends of the auto-mTLS tunnel put on their certificates; the
/// channel only ever crosses loopback.
const TLS_SERVER_NAME: &str = "localhost";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Large providers ship very large schemas (the AWS provider's is tens of
/// megabytes), so message limits are raised well past tonic's defaults.
const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Extracts version numbers from the plugin host's incompatibility error,
/// e.g. "Incompatible API version with plugin. Plugin version: 5, Client
/// versions: [6]". This text is the only signal the handshake surfaces for
/// a protocol-version mismatch.
fn protocol_mismatch_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Plugin version:\s*(\d+).*Client versions:\s*\[(\d+)\]")
            .expect("protocol mismatch pattern")
    })
}

/// If `err` is a protocol-version mismatch, return
/// `(provider_protocol, client_protocol)`.
pub(crate) fn protocol_mismatch(err: &anyhow::Error) -> Option<(u32, u32)> {
    let text = format!("{err:#}");
    let captures = protocol_mismatch_regex().captures(&text)?;
    let provider = captures.get(1)?.as_str().parse().ok()?;
    let client = captures.get(2)?.as_str().parse().ok()?;
    Some((provider, client))
}

/// The result of reading a data source: the decoded state mapping.
#[derive(Debug)]
pub struct DataSourceResult {
    pub state: serde_json::Map<String, Json>,
}

/// A provider subprocess after a successful handshake, before its schema has
/// been fetched. Not yet usable for reads.
pub(crate) struct LaunchedProvider {
    client: ProviderClient<Channel>,
    child: Child,
}

/// Start a provider binary and complete the plugin handshake: spawn with the
/// magic cookie and an ephemeral client certificate, read the
/// `CORE|APP|NETWORK|ADDR|PROTOCOL[|CERT]` line from stdout, require
/// protocol 6 over gRPC, and connect the channel — mutually-authenticated
/// TLS when the provider answered with its own certificate. Every failure
/// path kills the child before returning.
pub(crate) async fn launch(exec_path: &Path) -> Result<LaunchedProvider> {
    info!(path = %exec_path.display(), "starting provider");

    let identity = generate_client_identity()?;

    let mut child = Command::new(exec_path)
        .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
        .env(
            "PLUGIN_PROTOCOL_VERSIONS",
            SUPPORTED_PROTOCOL_VERSION.to_string(),
        )
        .env("PLUGIN_CLIENT_CERT", &identity.cert_pem)
        .env("PLUGIN_MIN_PORT", "10000")
        .env("PLUGIN_MAX_PORT", "25000")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to start provider binary")?;

    let stderr = child
        .stderr
        .take()
        .context("failed to capture provider stderr")?;
    drain_stderr(stderr);

    let stdout = child
        .stdout
        .take()
        .context("failed to capture provider stdout")?;

    let mut reader = tokio::io::BufReader::new(stdout);
    let mut line = String::new();
    let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await;

    let handshake = match read {
        Ok(Ok(0)) => {
            let _ = child.kill().await;
            bail!("provider exited before completing the handshake");
        }
        Ok(Err(err)) => {
            let _ = child.kill().await;
            return Err(err).context("failed to read provider handshake");
        }
        Err(_) => {
            let _ = child.kill().await;
            bail!(
                "provider handshake timed out after {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            );
        }
        Ok(Ok(_)) => match parse_handshake(line.trim()) {
            Ok(handshake) => handshake,
            Err(err) => {
                let _ = child.kill().await;
                return Err(err);
            }
        },
    };
    debug!(?handshake, "provider handshake");

    if handshake.core_protocol != 1 {
        debug!(
            core = handshake.core_protocol,
            "unexpected core handshake version, continuing"
        );
    }

    if handshake.app_protocol != SUPPORTED_PROTOCOL_VERSION {
        let _ = child.kill().await;
        // The canonical plugin-host phrasing, kept intact so callers can
        // pattern-match the mismatch.
        bail!(
            "Incompatible API version with plugin. Plugin version: {}, Client versions: [{}]",
            handshake.app_protocol,
            SUPPORTED_PROTOCOL_VERSION
        );
    }

    if handshake.protocol != "grpc" {
        let _ = child.kill().await;
        bail!("provider offered unsupported transport {:?}", handshake.protocol);
    }

    let authority = match connect_authority(&handshake).await {
        Ok(authority) => authority,
        Err(err) => {
            let _ = child.kill().await;
            return Err(err);
        }
    };

    let connect = async {
        // Providers that completed the mTLS exchange hand back their
        // certificate in the handshake; ones that did not get a plaintext
        // loopback channel, matching the plugin host's fallback.
        let url = if handshake.server_cert.is_some() {
            format!("https://{authority}")
        } else {
            format!("http://{authority}")
        };
        let mut endpoint = Channel::from_shared(url)
            .context("invalid provider endpoint")?
            .initial_stream_window_size((1 << 31) - 1)
            .initial_connection_window_size((1 << 31) - 1);
        if let Some(server_cert) = &handshake.server_cert {
            let tls = ClientTlsConfig::new()
                .domain_name(TLS_SERVER_NAME)
                .ca_certificate(Certificate::from_pem(server_certificate_pem(server_cert)?))
                .identity(Identity::from_pem(&identity.cert_pem, &identity.key_pem));
            endpoint = endpoint
                .tls_config(tls)
                .context("invalid provider TLS configuration")?;
        }
        endpoint
            .connect()
            .await
            .context("failed to connect to provider")
    };
    let channel = match connect.await {
        Ok(channel) => channel,
        Err(err) => {
            let _ = child.kill().await;
            return Err(err);
        }
    };

    let client = ProviderClient::new(channel)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);

    Ok(LaunchedProvider { client, child })
}

impl LaunchedProvider {
    /// Fetch and cache the provider schema, producing a live session. A
    /// schema failure kills the child before surfacing.
    pub(crate) async fn into_session(
        mut self,
        namespace: &str,
        name: &str,
        version: &str,
    ) -> Result<ProviderSession> {
        let response = self
            .client
            .get_provider_schema(tfplugin6::get_provider_schema::Request {})
            .await;

        let schema = match response {
            Ok(response) => {
                let schema = response.into_inner();
                match codec::check_diagnostics(&schema.diagnostics) {
                    Ok(()) => schema,
                    Err(err) => {
                        let _ = self.child.kill().await;
                        return Err(err).context("provider reported schema errors");
                    }
                }
            }
            Err(status) => {
                let _ = self.child.kill().await;
                return Err(anyhow!(status)).context("GetProviderSchema RPC failed");
            }
        };

        info!(
            data_sources = schema.data_source_schemas.len(),
            resources = schema.resource_schemas.len(),
            "provider schema loaded"
        );

        Ok(ProviderSession {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            client: self.client,
            schema,
            child: Mutex::new(Some(self.child)),
            configured: AtomicBool::new(false),
        })
    }
}

/// A live provider: subprocess, gRPC channel, and cached schema. Created by
/// the client orchestrator; always holds a schema.
#[derive(Debug)]
pub struct ProviderSession {
    namespace: String,
    name: String,
    version: String,
    client: ProviderClient<Channel>,
    schema: tfplugin6::get_provider_schema::Response,
    child: Mutex<Option<Child>>,
    configured: AtomicBool,
}

impl ProviderSession {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved provider version this session runs.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether `configure` has completed successfully. The core does not
    /// gate reads on this; most providers reject reads themselves until
    /// configured.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Data source type names advertised by the provider schema, in no
    /// particular order.
    pub fn list_data_sources(&self) -> Vec<String> {
        self.schema.data_source_schemas.keys().cloned().collect()
    }

    /// Configure the provider with an untyped configuration, encoded against
    /// the provider's own configuration block.
    pub async fn configure(&self, config: &Json) -> Result<(), Error> {
        self.configure_inner(config)
            .await
            .map_err(|source| Error::ConfigureFailed {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                source,
            })?;
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    async fn configure_inner(&self, config: &Json) -> Result<()> {
        let block = self
            .schema
            .provider
            .as_ref()
            .and_then(|schema| schema.block.as_ref())
            .context("provider schema has no configuration block")?;
        let config_type = codec::block_type(block)?;
        let msgpack = codec::encode(config, &config_type)?;

        let response = self
            .client
            .clone()
            .configure_provider(tfplugin6::configure_provider::Request {
                terraform_version: TERRAFORM_VERSION.to_string(),
                config: Some(tfplugin6::DynamicValue {
                    msgpack,
                    json: vec![],
                }),
                client_capabilities: None,
            })
            .await
            .context("ConfigureProvider RPC failed")?;

        codec::check_diagnostics(&response.into_inner().diagnostics)?;
        debug!(provider = %self.name, "provider configured");
        Ok(())
    }

    /// Read a data source and decode its state against the data source's
    /// block schema.
    pub async fn read_data_source(
        &self,
        type_name: &str,
        config: &Json,
    ) -> Result<DataSourceResult, Error> {
        let Some(schema) = self.schema.data_source_schemas.get(type_name) else {
            return Err(Error::DataSourceNotFound {
                type_name: type_name.to_string(),
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            });
        };

        let state = self
            .read_inner(type_name, schema, config)
            .await
            .with_context(|| format!("failed to read data source {type_name:?}"))?;
        Ok(DataSourceResult { state })
    }

    async fn read_inner(
        &self,
        type_name: &str,
        schema: &tfplugin6::Schema,
        config: &Json,
    ) -> Result<serde_json::Map<String, Json>> {
        let block = schema
            .block
            .as_ref()
            .context("data source schema has no block")?;
        let block_type = codec::block_type(block)?;
        let msgpack = codec::encode(config, &block_type)?;

        let response = self
            .client
            .clone()
            .read_data_source(tfplugin6::read_data_source::Request {
                type_name: type_name.to_string(),
                config: Some(tfplugin6::DynamicValue {
                    msgpack,
                    json: vec![],
                }),
                provider_meta: None,
                client_capabilities: None,
            })
            .await
            .context("ReadDataSource RPC failed")?
            .into_inner();

        codec::check_diagnostics(&response.diagnostics)?;

        let state = match response.state {
            Some(dv) => codec::decode(&dv, &block_type).context("failed to decode state")?,
            None => Json::Null,
        };
        match state {
            Json::Null => Ok(serde_json::Map::new()),
            Json::Object(map) => Ok(map),
            other => bail!("data source returned non-object state: {other}"),
        }
    }

    /// Terminate the provider subprocess: best-effort StopProvider RPC, then
    /// kill. Idempotent and safe on an already-dead session.
    pub async fn close(&self) -> Result<(), Error> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = self
                .client
                .clone()
                .stop_provider(tfplugin6::stop_provider::Request {})
                .await;
            let _ = child.kill().await;
            debug!(provider = %self.name, "provider stopped");
        }
        Ok(())
    }
}

/// Ephemeral certificate offered to the provider through the handshake so
/// the gRPC channel can be mutually authenticated.
struct ClientIdentity {
    cert_pem: String,
    key_pem: String,
}

/// Self-signed certificate for this launch, mirroring what the plugin host
/// generates for its auto-mTLS exchange: CA-capable, client and server auth,
/// named for the loopback tunnel.
fn generate_client_identity() -> Result<ClientIdentity> {
    let mut params = rcgen::CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
        .context("failed to build client certificate parameters")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, TLS_SERVER_NAME);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
        rcgen::KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let key_pair = rcgen::KeyPair::generate().context("failed to generate client key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign client certificate")?;

    Ok(ClientIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// The handshake carries the provider certificate as unpadded base64 DER;
/// tonic wants PEM.
fn server_certificate_pem(encoded: &str) -> Result<String> {
    use base64::Engine;

    let der = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .context("failed to decode provider certificate")?;

    let body = base64::engine::general_purpose::STANDARD.encode(&der);
    let mut pem = String::with_capacity(body.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    Ok(pem)
}

/// A parsed go-plugin handshake line:
/// `CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|PROTOCOL[|TLS-CERT]`.
#[derive(Debug)]
struct Handshake {
    core_protocol: u32,
    app_protocol: u32,
    network_type: String,
    address: String,
    protocol: String,
    /// Provider certificate (base64 DER) completing the mTLS exchange;
    /// absent when the provider runs without transport security.
    server_cert: Option<String>,
}

fn parse_handshake(line: &str) -> Result<Handshake> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 5 {
        bail!("invalid provider handshake (expected 5 pipe-separated fields): {line:?}");
    }

    Ok(Handshake {
        core_protocol: parts[0].parse().context("invalid core protocol version")?,
        app_protocol: parts[1].parse().context("invalid app protocol version")?,
        network_type: parts[2].to_string(),
        address: parts[3].to_string(),
        protocol: parts[4].to_string(),
        server_cert: parts
            .get(5)
            .filter(|cert| !cert.is_empty())
            .map(|cert| cert.to_string()),
    })
}

/// Resolve the handshake's advertised address to an authority tonic can
/// dial. Unix sockets are bridged through a local TCP proxy: dialing them
/// directly through a custom connector breaks HTTP/2 connection-level flow
/// control on very large schema responses. TLS, when negotiated, runs
/// end-to-end through the proxy.
async fn connect_authority(handshake: &Handshake) -> Result<String> {
    match handshake.network_type.as_str() {
        "tcp" => Ok(handshake.address.clone()),
        #[cfg(unix)]
        "unix" => proxy_unix_socket(handshake.address.clone()).await,
        other => bail!("provider advertised unsupported network type {other:?}"),
    }
}

#[cfg(unix)]
async fn proxy_unix_socket(socket_path: String) -> Result<String> {
    use tokio::net::{TcpListener, UnixStream};

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind unix-socket proxy")?;
    let proxy_addr = listener
        .local_addr()
        .context("failed to resolve proxy address")?;
    debug!(socket = %socket_path, proxy = %proxy_addr, "bridging provider unix socket");

    tokio::spawn(async move {
        loop {
            let Ok((tcp_stream, _)) = listener.accept().await else {
                break;
            };
            let path = socket_path.clone();
            tokio::spawn(async move {
                match UnixStream::connect(&path).await {
                    Ok(unix_stream) => {
                        let (mut tcp_read, mut tcp_write) = tokio::io::split(tcp_stream);
                        let (mut unix_read, mut unix_write) = tokio::io::split(unix_stream);
                        let to_unix = tokio::io::copy(&mut tcp_read, &mut unix_write);
                        let to_tcp = tokio::io::copy(&mut unix_read, &mut tcp_write);
                        let _ = tokio::try_join!(to_unix, to_tcp);
                    }
                    Err(err) => {
                        warn!(socket = %path, "failed to reach provider socket: {err}");
                    }
                }
            });
        }
    });

    Ok(proxy_addr.to_string())
}

/// Forward provider stderr through tracing. Providers emit go-hclog JSON;
/// warn and above surface at `warn`, the rest stays at `debug` so startup
/// chatter does not flood the log. Draining also keeps the provider from
/// blocking once its output exceeds the OS pipe buffer.
fn drain_stderr(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let important = match serde_json::from_str::<Json>(line) {
                Ok(parsed) => matches!(
                    parsed.get("@level").and_then(Json::as_str),
                    Some("warn" | "error" | "fatal")
                ),
                Err(_) => {
                    let upper = line.to_uppercase();
                    upper.contains("PANIC")
                        || upper.contains("FATAL")
                        || upper.starts_with("[ERROR]")
                        || upper.starts_with("[WARN]")
                }
            };
            if important {
                warn!(target: "provider_stderr", "{line}");
            } else {
                debug!(target: "provider_stderr", "{line}");
            }
        }
    });
}
