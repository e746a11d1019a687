use super::response::secret_response;
use super::stream::StreamHandler;
use super::ServerInner;
use crate::error::SdsError;
use crate::prelude::{debug, warn};
use crate::resource::{Resource, SdsMode};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::secret::v3::{
    secret_discovery_service_server::SecretDiscoveryService,
};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};

const RESPONSE_BUFFER: usize = 8;

type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

/// `SecretDiscoveryService` implementation for one socket.
///
/// Obtained from [`SdsServer::service`](crate::SdsServer::service) to mount on a
/// caller-managed tonic server.
#[derive(Clone)]
pub struct SdsService {
    inner: Arc<ServerInner>,
    mode: SdsMode,
}

impl fmt::Debug for SdsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdsService")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SdsService {
    pub(crate) fn new(inner: Arc<ServerInner>, mode: SdsMode) -> Self {
        Self { inner, mode }
    }

    /// Socket mode served by this instance.
    pub fn mode(&self) -> SdsMode {
        self.mode
    }

    async fn fetch(
        &self,
        metadata: &MetadataMap,
        request: DiscoveryRequest,
    ) -> Result<DiscoveryResponse, SdsError> {
        let name = match request.resource_names.as_slice() {
            [] => return Err(SdsError::MissingResourceName),
            [name] => name,
            _ => {
                return Err(SdsError::MultipleResourceNames(
                    request.resource_names.clone(),
                ))
            }
        };
        let proxy_id = request
            .node
            .as_ref()
            .map(|node| node.id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or(SdsError::MissingNode)?;

        let resource = Resource::parse(name);
        if !resource.is_served(self.mode) {
            return Err(SdsError::UnknownResource(name.clone()));
        }

        let token = self.inner.token_source.resolve(metadata).await?;
        let connection_id = self.inner.next_connection_id(proxy_id);
        let provider = &self.inner.provider;
        let generated = provider.generate(&connection_id, name, &token).await;
        // Nothing subscribes under a unary connection id.
        provider.delete(&connection_id, name);
        let item = generated.map_err(|err| SdsError::generation(name, err))?;

        debug!(
            "Fetched secret: conn={}, resource={}, version={}",
            connection_id,
            name,
            item.version()
        );
        Ok(secret_response(&resource, &item))
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for SdsService {
    type DeltaSecretsStream = DeltaStream;

    async fn delta_secrets(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(Status::unimplemented("delta SDS is not supported"))
    }

    type StreamSecretsStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        let (metadata, _extensions, requests) = request.into_parts();
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

        let handler = StreamHandler::new(Arc::clone(&self.inner), self.mode, metadata, tx);
        tokio::spawn(handler.run(requests));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let (metadata, _extensions, request) = request.into_parts();
        match self.fetch(&metadata, request).await {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => {
                warn!("FetchSecrets failed: mode={}, error={}", self.mode, err);
                Err(err.into())
            }
        }
    }
}
