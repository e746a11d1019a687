#![allow(dead_code)]

use envoy_types::pb::envoy::config::core::v3::{data_source, DataSource, Node};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{secret, Secret};
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::envoy::service::secret::v3::{
    secret_discovery_service_client::SecretDiscoveryServiceClient,
};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use hyper_util::rt::TokioIo;
use prost::Message;
use sds_agent::{
    CacheCheck, GenerateFuture, ProviderError, Resource, ResourceKind, SdsMetrics, SdsMode,
    SdsServer, SdsServerBuilder, SecretItem, SecretProvider, SubscriptionKey, VersionClock,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status, Streaming};
use tower::service_fn;

pub const NODE_ID: &str = "sidecar~10.0.0.1~httpbin-7d8f.default~default.svc.cluster.local";
pub const TOKEN: &str = "FakeToken";

pub const ROOT_CERT: &[u8] = &[0];
pub const CERT_CHAIN: &[u8] = &[1];
pub const PRIVATE_KEY: &[u8] = &[2];
pub const PUSHED_CERT_CHAIN: &[u8] = &[3];
pub const PUSHED_PRIVATE_KEY: &[u8] = &[4];

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(300);

// -----------------------
// Secret provider
// -----------------------

/// In-memory provider with fake key material.
#[derive(Default)]
pub struct MockSecretStore {
    secrets: Mutex<HashMap<SubscriptionKey, Arc<SecretItem>>>,
    deleted: Mutex<Vec<SubscriptionKey>>,
    expected_token: Option<String>,
    clock: VersionClock,
    generated: AtomicUsize,
    defer: AtomicBool,
}

impl MockSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every token other than `token`.
    pub fn with_expected_token(token: &str) -> Self {
        Self {
            expected_token: Some(token.to_string()),
            ..Self::default()
        }
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<SubscriptionKey> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn cached(&self, key: &SubscriptionKey) -> Option<Arc<SecretItem>> {
        self.secrets.lock().unwrap().get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.lock().unwrap().is_empty()
    }

    pub fn set_defer(&self, defer: bool) {
        self.defer.store(defer, Ordering::SeqCst);
    }

    /// Replaces the cached workload certificate of `key` with the "pushed" material.
    pub fn rotate(&self, key: &SubscriptionKey) -> Arc<SecretItem> {
        let item = Arc::new(
            SecretItem::new(key.resource_name(), self.clock.next_version())
                .with_certificate_chain(PUSHED_CERT_CHAIN.to_vec())
                .with_private_key(PUSHED_PRIVATE_KEY.to_vec()),
        );
        self.secrets
            .lock()
            .unwrap()
            .insert(key.clone(), Arc::clone(&item));
        item
    }

    async fn material(&self, resource_name: &str) -> Result<SecretItem, ProviderError> {
        let version = self.clock.next_version();
        let resource = Resource::parse(resource_name);
        let item = match resource.kind() {
            ResourceKind::FileRoot(path) => {
                let root = tokio::fs::read(path)
                    .await
                    .map_err(|e| ProviderError::Generation(e.to_string()))?;
                SecretItem::new(resource_name, version).with_root_cert(root)
            }
            _ if resource.is_root() => {
                SecretItem::new(resource_name, version).with_root_cert(ROOT_CERT.to_vec())
            }
            _ => SecretItem::new(resource_name, version)
                .with_certificate_chain(CERT_CHAIN.to_vec())
                .with_private_key(PRIVATE_KEY.to_vec()),
        };
        Ok(item)
    }
}

impl SecretProvider for MockSecretStore {
    fn generate<'a>(
        &'a self,
        connection_id: &'a str,
        resource_name: &'a str,
        token: &'a str,
    ) -> GenerateFuture<'a> {
        Box::pin(async move {
            if let Some(expected) = &self.expected_token {
                if token != expected {
                    return Err(ProviderError::Auth(format!("unexpected token {token:?}")));
                }
            }

            let key = SubscriptionKey::new(connection_id, resource_name);
            if let Some(item) = self.cached(&key) {
                return Ok(item);
            }

            let item = Arc::new(self.material(resource_name).await?);
            self.generated.fetch_add(1, Ordering::SeqCst);
            self.secrets
                .lock()
                .unwrap()
                .insert(key, Arc::clone(&item));
            Ok(item)
        })
    }

    fn check(
        &self,
        connection_id: &str,
        resource_name: &str,
        _token: &str,
        version: &str,
    ) -> CacheCheck {
        let key = SubscriptionKey::new(connection_id, resource_name);
        match self.cached(&key) {
            None => CacheCheck::MissAbsent,
            Some(item) if item.version() == version => CacheCheck::Hit,
            Some(_) => CacheCheck::MissStale,
        }
    }

    fn delete(&self, connection_id: &str, resource_name: &str) {
        let key = SubscriptionKey::new(connection_id, resource_name);
        self.secrets.lock().unwrap().remove(&key);
        self.deleted.lock().unwrap().push(key);
    }

    fn should_defer_for_external_secret(
        &self,
        _connection_id: &str,
        _resource_name: &str,
        _token: &str,
        _file_mounted_only: bool,
    ) -> bool {
        self.defer.load(Ordering::SeqCst)
    }
}

// -----------------------
// Server harness
// -----------------------

pub struct TestServer {
    pub server: SdsServer,
    pub store: Arc<MockSecretStore>,
    pub metrics: Arc<SdsMetrics>,
    pub workload_socket: PathBuf,
    pub gateway_socket: PathBuf,
    dir: TempDir,
}

impl TestServer {
    /// Workload and gateway SDS in a fresh temp dir, tokens from request metadata.
    pub async fn start() -> Self {
        Self::start_with(MockSecretStore::new(), |builder| builder).await
    }

    pub async fn start_with(
        store: MockSecretStore,
        configure: impl FnOnce(SdsServerBuilder) -> SdsServerBuilder,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workload_socket = dir.path().join("workload").join("sds.sock");
        let gateway_socket = dir.path().join("gateway").join("sds.sock");
        let store = Arc::new(store);
        let metrics = Arc::new(SdsMetrics::new());

        let builder = SdsServer::builder(Arc::clone(&store) as Arc<dyn SecretProvider>)
            .workload_socket(&workload_socket)
            .gateway_socket(&gateway_socket)
            .metrics(metrics.clone());
        let server = configure(builder).serve().await.unwrap();

        Self {
            server,
            store,
            metrics,
            workload_socket,
            gateway_socket,
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub async fn client(&self, mode: SdsMode) -> SecretDiscoveryServiceClient<Channel> {
        let path = match mode {
            SdsMode::Workload => &self.workload_socket,
            SdsMode::Gateway => &self.gateway_socket,
        };
        SecretDiscoveryServiceClient::new(connect(path).await)
    }

    /// Opens a workload stream presenting `TOKEN`.
    pub async fn stream(&self) -> SdsStream {
        self.open_stream(SdsMode::Workload, Some(TOKEN)).await
    }

    pub async fn open_stream(&self, mode: SdsMode, token: Option<&str>) -> SdsStream {
        let mut client = self.client(mode).await;
        let (tx, rx) = mpsc::channel(16);
        let mut request = Request::new(ReceiverStream::new(rx));
        if let Some(token) = token {
            request
                .metadata_mut()
                .insert("authorization", format!("Bearer {token}").parse().unwrap());
        }
        let responses = client.stream_secrets(request).await.unwrap().into_inner();
        SdsStream {
            tx,
            responses,
            _client: client,
        }
    }

    /// Waits until the proxy `NODE_ID` has a live subscription and returns its key.
    pub async fn key(&self, resource_name: &str) -> SubscriptionKey {
        let registry = self.server.registry();
        let connection_id = eventually(|| registry.find_connection_id(NODE_ID)).await;
        SubscriptionKey::new(connection_id, resource_name)
    }

    pub async fn wait_for_subscriptions(&self, count: usize) {
        let registry = self.server.registry();
        eventually(|| (registry.len() == count).then_some(())).await;
    }
}

/// Connects to a Unix domain socket the same way a proxy does.
pub async fn connect(path: &Path) -> Channel {
    let path = Arc::new(path.to_path_buf());
    Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = Arc::clone(&path);
            async move {
                let stream = UnixStream::connect(path.as_path()).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .unwrap()
}

/// Polls `condition` until it yields a value, panicking after a few seconds.
pub async fn eventually<T>(mut condition: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if let Some(value) = condition() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// -----------------------
// Client stream
// -----------------------

pub struct SdsStream {
    tx: mpsc::Sender<DiscoveryRequest>,
    responses: Streaming<DiscoveryResponse>,
    _client: SecretDiscoveryServiceClient<Channel>,
}

impl SdsStream {
    pub async fn send(&self, request: DiscoveryRequest) {
        self.tx.send(request).await.unwrap();
    }

    pub async fn next(&mut self) -> Result<Option<DiscoveryResponse>, Status> {
        tokio::time::timeout(RECV_TIMEOUT, self.responses.message())
            .await
            .expect("timed out waiting for the server")
    }

    pub async fn recv(&mut self) -> DiscoveryResponse {
        self.next()
            .await
            .unwrap()
            .expect("stream ended unexpectedly")
    }

    pub async fn recv_status(&mut self) -> Status {
        self.next().await.expect_err("expected the stream to fail")
    }

    /// Asserts the stream ends cleanly.
    pub async fn expect_end(&mut self) {
        let next = self.next().await.unwrap();
        assert!(next.is_none(), "expected end of stream, got {next:?}");
    }

    /// Asserts nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let outcome = tokio::time::timeout(SILENCE, self.responses.message()).await;
        assert!(outcome.is_err(), "unexpected message: {outcome:?}");
    }

    /// Sends an initial request for `resource_name` and returns the first response.
    pub async fn subscribe(&mut self, resource_name: &str) -> DiscoveryResponse {
        self.send(request(resource_name, "", "")).await;
        self.recv().await
    }

    pub async fn ack(&self, resource_name: &str, response: &DiscoveryResponse) {
        self.send(request(resource_name, &response.version_info, &response.nonce))
            .await;
    }

    pub async fn nack(
        &self,
        resource_name: &str,
        accepted_version: &str,
        response: &DiscoveryResponse,
    ) {
        let mut nack = request(resource_name, accepted_version, &response.nonce);
        nack.error_detail = Some(RpcStatus {
            code: tonic::Code::InvalidArgument as i32,
            message: "failed to load certificate".to_string(),
            ..Default::default()
        });
        self.send(nack).await;
    }
}

// -----------------------
// Messages
// -----------------------

pub fn node() -> Node {
    Node {
        id: NODE_ID.to_string(),
        ..Default::default()
    }
}

pub fn request(resource_name: &str, version: &str, nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(node()),
        resource_names: if resource_name.is_empty() {
            Vec::new()
        } else {
            vec![resource_name.to_string()]
        },
        version_info: version.to_string(),
        response_nonce: nonce.to_string(),
        type_url: sds_agent::constants::SECRET_TYPE_URL.to_string(),
        ..Default::default()
    }
}

pub fn decode_secret(response: &DiscoveryResponse) -> Secret {
    assert_eq!(response.resources.len(), 1, "expected exactly one resource");
    assert_eq!(response.type_url, sds_agent::constants::SECRET_TYPE_URL);
    Secret::decode(&response.resources[0].value[..]).unwrap()
}

fn inline(source: Option<&DataSource>) -> Vec<u8> {
    match source.and_then(|source| source.specifier.as_ref()) {
        Some(data_source::Specifier::InlineBytes(bytes)) => bytes[..].to_vec(),
        other => panic!("unexpected data source: {other:?}"),
    }
}

/// Asserts `response` carries a TLS certificate named `name` and returns (chain, key).
pub fn certificate(response: &DiscoveryResponse, name: &str) -> (Vec<u8>, Vec<u8>) {
    let secret = decode_secret(response);
    assert_eq!(secret.name, name);
    match secret.r#type {
        Some(secret::Type::TlsCertificate(cert)) => (
            inline(cert.certificate_chain.as_ref()),
            inline(cert.private_key.as_ref()),
        ),
        other => panic!("expected a TLS certificate, got {other:?}"),
    }
}

/// Asserts `response` carries a validation context named `name` and returns its trusted CA.
pub fn root_cert(response: &DiscoveryResponse, name: &str) -> Vec<u8> {
    let secret = decode_secret(response);
    assert_eq!(secret.name, name);
    match secret.r#type {
        Some(secret::Type::ValidationContext(context)) => inline(context.trusted_ca.as_ref()),
        other => panic!("expected a validation context, got {other:?}"),
    }
}
