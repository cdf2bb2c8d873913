//! Configure and data-source reads against a real handshake-completed
//! session. An in-process gRPC server implements the protocol-6 service; a
//! shell script stands in for the provider binary and hands the server's
//! address to the client through the handshake line.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tf_data_client::cache::{ArtifactId, Cache, ProduceArchive};
use tf_data_client::provider::tfplugin6::{self, provider_server};
use tf_data_client::registry::{DownloadInfo, Registry, VersionInfo};
use tf_data_client::{Client, Error, ProviderRef, ProviderSession};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

/// Cache stub that always hits on a fixed executable.
struct StaticCache {
    exec: PathBuf,
}

#[async_trait]
impl Cache for StaticCache {
    async fn get(&self, _id: &ArtifactId) -> Result<Option<PathBuf>> {
        Ok(Some(self.exec.clone()))
    }

    async fn has(&self, _id: &ArtifactId) -> Result<bool> {
        Ok(true)
    }

    async fn put(&self, _id: &ArtifactId, _archive: &Path) -> Result<PathBuf> {
        Ok(self.exec.clone())
    }

    async fn get_or_put(&self, _id: &ArtifactId, _produce: ProduceArchive<'_>) -> Result<PathBuf> {
        Ok(self.exec.clone())
    }
}

struct UnusedRegistry;

#[async_trait]
impl Registry for UnusedRegistry {
    async fn get_versions(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Vec<VersionInfo>, Error> {
        panic!("registry must not be consulted");
    }

    async fn get_latest_version(&self, _namespace: &str, _name: &str) -> Result<String, Error> {
        panic!("registry must not be consulted");
    }

    async fn get_download_info(
        &self,
        _namespace: &str,
        _name: &str,
        _version: &str,
        _os: &str,
        _arch: &str,
    ) -> Result<DownloadInfo, Error> {
        panic!("registry must not be consulted");
    }

    async fn download_to_path(&self, _info: &DownloadInfo, _dest: &Path) -> Result<(), Error> {
        panic!("registry must not be consulted");
    }
}

#[derive(Default)]
struct ProviderState {
    configured: AtomicBool,
    stopped: AtomicBool,
}

/// Minimal provider: one string config attribute, one data source
/// (`fake_greeting`) that greets the configured name.
struct FakeProvider {
    state: Arc<ProviderState>,
}

fn string_attribute(name: &str, optional: bool, computed: bool) -> tfplugin6::schema::Attribute {
    tfplugin6::schema::Attribute {
        name: name.to_string(),
        r#type: b"\"string\"".to_vec(),
        optional,
        computed,
        ..Default::default()
    }
}

fn block_schema(attributes: Vec<tfplugin6::schema::Attribute>) -> tfplugin6::Schema {
    tfplugin6::Schema {
        version: 0,
        block: Some(tfplugin6::schema::Block {
            attributes,
            ..Default::default()
        }),
    }
}

/// Pull one string attribute out of a msgpack-encoded dynamic value.
fn msgpack_field(dv: &Option<tfplugin6::DynamicValue>, field: &str) -> Option<String> {
    let dv = dv.as_ref()?;
    let value = rmpv::decode::read_value(&mut dv.msgpack.as_slice()).ok()?;
    let rmpv::Value::Map(entries) = value else {
        return None;
    };
    entries
        .iter()
        .find(|(key, _)| key.as_str() == Some(field))
        .and_then(|(_, item)| item.as_str().map(str::to_string))
}

#[tonic::async_trait]
impl provider_server::Provider for FakeProvider {
    async fn get_provider_schema(
        &self,
        _request: Request<tfplugin6::get_provider_schema::Request>,
    ) -> Result<Response<tfplugin6::get_provider_schema::Response>, Status> {
        let mut data_source_schemas = HashMap::new();
        data_source_schemas.insert(
            "fake_greeting".to_string(),
            block_schema(vec![
                string_attribute("name", true, false),
                string_attribute("greeting", false, true),
            ]),
        );
        Ok(Response::new(tfplugin6::get_provider_schema::Response {
            provider: Some(block_schema(vec![string_attribute("endpoint", true, false)])),
            data_source_schemas,
            ..Default::default()
        }))
    }

    async fn configure_provider(
        &self,
        request: Request<tfplugin6::configure_provider::Request>,
    ) -> Result<Response<tfplugin6::configure_provider::Response>, Status> {
        let request = request.into_inner();
        if msgpack_field(&request.config, "endpoint").as_deref() == Some("boom") {
            return Ok(Response::new(tfplugin6::configure_provider::Response {
                diagnostics: vec![tfplugin6::Diagnostic {
                    severity: tfplugin6::diagnostic::Severity::Error as i32,
                    summary: "unreachable endpoint".to_string(),
                    detail: "boom is not a real endpoint".to_string(),
                    attribute: None,
                }],
            }));
        }
        self.state.configured.store(true, Ordering::SeqCst);
        Ok(Response::new(tfplugin6::configure_provider::Response {
            diagnostics: vec![],
        }))
    }

    async fn read_data_source(
        &self,
        request: Request<tfplugin6::read_data_source::Request>,
    ) -> Result<Response<tfplugin6::read_data_source::Response>, Status> {
        let request = request.into_inner();
        if request.type_name != "fake_greeting" {
            return Err(Status::invalid_argument("unknown data source"));
        }

        let name =
            msgpack_field(&request.config, "name").unwrap_or_else(|| "world".to_string());
        let state = rmpv::Value::Map(vec![
            (
                rmpv::Value::from("greeting"),
                rmpv::Value::from(format!("hello, {name}")),
            ),
            (rmpv::Value::from("name"), rmpv::Value::from(name)),
        ]);
        let mut msgpack = Vec::new();
        rmpv::encode::write_value(&mut msgpack, &state)
            .map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(tfplugin6::read_data_source::Response {
            state: Some(tfplugin6::DynamicValue {
                msgpack,
                json: vec![],
            }),
            diagnostics: vec![],
        }))
    }

    async fn stop_provider(
        &self,
        _request: Request<tfplugin6::stop_provider::Request>,
    ) -> Result<Response<tfplugin6::stop_provider::Response>, Status> {
        self.state.stopped.store(true, Ordering::SeqCst);
        Ok(Response::new(tfplugin6::stop_provider::Response {
            error: String::new(),
        }))
    }
}

async fn start_fake_provider(state: Arc<ProviderState>) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(provider_server::ProviderServer::new(FakeProvider { state }))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    addr
}

/// The "provider binary": prints a protocol-6 handshake pointing at the
/// in-process server, then waits to be killed.
fn write_handshake_script(dir: &Path, addr: std::net::SocketAddr) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("terraform-provider-fake_v1.0.0");
    std::fs::write(
        &path,
        format!("#!/bin/sh\necho \"1|6|tcp|{addr}|grpc\"\nsleep 30\n"),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn start_session(state: Arc<ProviderState>) -> (TempDir, Client, Arc<ProviderSession>) {
    let addr = start_fake_provider(state).await;
    let dir = TempDir::new().unwrap();
    let exec = write_handshake_script(dir.path(), addr);

    let client = Client::builder()
        .cache(StaticCache { exec })
        .registry(UnusedRegistry)
        .build()
        .unwrap();
    let session = client
        .create_provider(&ProviderRef::with_version("fakecorp", "fake", "1.0.0"))
        .await
        .unwrap();
    (dir, client, session)
}

#[tokio::test]
async fn configure_then_read_round_trips() {
    let state = Arc::new(ProviderState::default());
    let (_dir, client, session) = start_session(state.clone()).await;

    assert_eq!(session.list_data_sources(), vec!["fake_greeting"]);
    assert!(!session.is_configured());

    session
        .configure(&json!({"endpoint": "http://127.0.0.1"}))
        .await
        .unwrap();
    assert!(session.is_configured());
    assert!(state.configured.load(Ordering::SeqCst));

    let result = session
        .read_data_source("fake_greeting", &json!({"name": "tofu"}))
        .await
        .unwrap();
    assert_eq!(result.state.get("greeting"), Some(&json!("hello, tofu")));
    assert_eq!(result.state.get("name"), Some(&json!("tofu")));

    client.close().await.unwrap();
    assert!(state.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unknown_data_source_fails_and_known_reads_still_succeed() {
    let state = Arc::new(ProviderState::default());
    let (_dir, client, session) = start_session(state.clone()).await;

    session.configure(&json!({})).await.unwrap();

    let err = session
        .read_data_source("nope", &json!({}))
        .await
        .unwrap_err();
    match err {
        Error::DataSourceNotFound {
            type_name,
            namespace,
            name,
        } => {
            assert_eq!(type_name, "nope");
            assert_eq!(namespace, "fakecorp");
            assert_eq!(name, "fake");
        }
        other => panic!("expected DataSourceNotFound, got {other:?}"),
    }

    // The failed lookup must not poison the session.
    let result = session
        .read_data_source("fake_greeting", &json!({}))
        .await
        .unwrap();
    assert_eq!(result.state.get("greeting"), Some(&json!("hello, world")));

    client.close().await.unwrap();
}

#[tokio::test]
async fn configure_error_diagnostics_surface_as_configure_failed() {
    let state = Arc::new(ProviderState::default());
    let (_dir, client, session) = start_session(state.clone()).await;

    let err = session
        .configure(&json!({"endpoint": "boom"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigureFailed { .. }), "got {err:?}");
    assert!(!session.is_configured());
    assert!(!state.configured.load(Ordering::SeqCst));

    client.close().await.unwrap();
}
