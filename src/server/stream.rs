//! Per-stream SDS state machine.
//!
//! One [`StreamHandler`] task serves one `StreamSecrets` call. It waits on whichever comes
//! first: the next client request, a delivery on one of the stream's subscription slots,
//! server shutdown, or the client dropping the response stream.

use super::response::secret_response;
use super::ServerInner;
use crate::error::SdsError;
use crate::prelude::{debug, info, warn};
use crate::registry::{Delivery, Subscription};
use crate::resource::{Resource, SdsMode, SubscriptionKey};
use crate::secret::SecretItem;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{StreamExt as _, StreamMap};
use tonic::metadata::MetadataMap;
use tonic::{Status, Streaming};

pub(crate) type ResponseSender = mpsc::Sender<Result<DiscoveryResponse, Status>>;

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    ClientClosed,
    ClientGone,
    Tombstone,
    Recycled,
    Shutdown,
}

impl CloseReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ClientGone => "client_gone",
            Self::Tombstone => "tombstone",
            Self::Recycled => "recycled",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
enum Exit {
    Closed(CloseReason),
    Failed(SdsError),
}

impl From<SdsError> for Exit {
    fn from(err: SdsError) -> Self {
        Self::Failed(err)
    }
}

#[derive(Debug)]
struct Connection {
    connection_id: String,
    token: String,
}

#[derive(Debug)]
struct StreamSubscription {
    resource: Resource,
    handle: Arc<Subscription>,
    // Push that arrived while a response was in flight.
    parked: Option<Arc<SecretItem>>,
}

pub(crate) struct StreamHandler {
    inner: Arc<ServerInner>,
    mode: SdsMode,
    metadata: MetadataMap,
    responses: ResponseSender,
    connection: Option<Arc<Connection>>,
    subscriptions: HashMap<String, StreamSubscription>,
    deliveries: StreamMap<String, WatchStream<Delivery>>,
}

impl StreamHandler {
    pub(crate) fn new(
        inner: Arc<ServerInner>,
        mode: SdsMode,
        metadata: MetadataMap,
        responses: ResponseSender,
    ) -> Self {
        Self {
            inner,
            mode,
            metadata,
            responses,
            connection: None,
            subscriptions: HashMap::new(),
            deliveries: StreamMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut requests: Streaming<DiscoveryRequest>) {
        let exit = self.serve(&mut requests).await;
        self.teardown(exit).await;
    }

    async fn serve(&mut self, requests: &mut Streaming<DiscoveryRequest>) -> Exit {
        loop {
            let step = tokio::select! {
                () = self.inner.shutdown.cancelled() => Err(Exit::Closed(CloseReason::Shutdown)),
                () = self.responses.closed() => Err(Exit::Closed(CloseReason::ClientGone)),
                message = requests.message() => match message {
                    Ok(Some(request)) => self.on_request(request).await,
                    Ok(None) => Err(Exit::Closed(CloseReason::ClientClosed)),
                    Err(_status) => {
                        debug!("SDS stream receive failed: status={}", _status);
                        Err(Exit::Closed(CloseReason::ClientGone))
                    }
                },
                Some((name, delivery)) = self.deliveries.next(), if !self.deliveries.is_empty() => {
                    self.on_delivery(name, delivery).await
                }
            };

            if let Err(exit) = step {
                return exit;
            }
        }
    }

    async fn on_request(&mut self, request: DiscoveryRequest) -> Result<(), Exit> {
        if request.resource_names.len() > 1 {
            return Err(SdsError::MultipleResourceNames(request.resource_names).into());
        }
        let connection = self.connection(&request).await?;

        if let Some(detail) = &request.error_detail {
            return self.on_nack(&request.response_nonce, &detail.message).await;
        }

        let Some(name) = request.resource_names.first() else {
            self.unsubscribe(&connection, &request.response_nonce);
            return Ok(());
        };

        let resource = Resource::parse(name);
        if !resource.is_served(self.mode) {
            debug!(
                "Ignoring request for unknown resource: conn={}, resource={}",
                connection.connection_id, name
            );
            return Ok(());
        }

        self.on_subscribe(&connection, resource, &request).await
    }

    async fn connection(
        &mut self,
        request: &DiscoveryRequest,
    ) -> Result<Arc<Connection>, SdsError> {
        if let Some(connection) = &self.connection {
            return Ok(Arc::clone(connection));
        }

        let proxy_id = request
            .node
            .as_ref()
            .map(|node| node.id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or(SdsError::MissingNode)?;
        let token = self.inner.token_source.resolve(&self.metadata).await?;
        let connection = Arc::new(Connection {
            connection_id: self.inner.next_connection_id(proxy_id),
            token,
        });
        info!(
            "New SDS connection: conn={}, mode={}",
            connection.connection_id, self.mode
        );
        self.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn on_subscribe(
        &mut self,
        connection: &Connection,
        resource: Resource,
        request: &DiscoveryRequest,
    ) -> Result<(), Exit> {
        let name = resource.name().to_owned();
        let handle = self.subscribe(connection, resource);
        handle.touch();

        if !request.response_nonce.is_empty()
            && handle.acknowledge(&request.response_nonce, &request.version_info)
        {
            debug!(
                "SDS ACK: key={}, version={}, nonce={}",
                handle.key(),
                request.version_info,
                request.response_nonce
            );
            if let Some(parked) = self.take_parked(&name) {
                return self.send_secret(&name, parked).await;
            }
        }

        let provider = &self.inner.provider;
        let check = provider.check(
            &connection.connection_id,
            &name,
            &connection.token,
            &request.version_info,
        );
        self.inner.metrics.record_cache_check(check);
        if check.is_hit() {
            handle.acknowledge_version(&request.version_info);
            debug!(
                "Cache hit, nothing to send: key={}, version={}",
                handle.key(),
                request.version_info
            );
            return Ok(());
        }

        if handle.is_in_flight() {
            debug!("Response in flight, holding request: key={}", handle.key());
            return Ok(());
        }
        if handle.is_suspended() {
            debug!("Key suspended after NACK: key={}", handle.key());
            return Ok(());
        }
        if provider.should_defer_for_external_secret(
            &connection.connection_id,
            &name,
            &connection.token,
            self.inner.options.file_mounted_certs,
        ) {
            debug!("Waiting for external secret: key={}", handle.key());
            return Ok(());
        }

        let item = provider
            .generate(&connection.connection_id, &name, &connection.token)
            .await
            .map_err(|err| SdsError::generation(&name, err))?;
        self.send_secret(&name, item).await
    }

    fn subscribe(&mut self, connection: &Connection, resource: Resource) -> Arc<Subscription> {
        let existing = self
            .subscriptions
            .get(resource.name())
            .map(|subscription| Arc::clone(&subscription.handle));
        if let Some(handle) = existing {
            if !handle.is_closed() {
                return handle;
            }
            // Reaped while its close was still queued.
            self.remove_subscription(resource.name());
        }

        let name = resource.name().to_owned();
        let key = SubscriptionKey::new(connection.connection_id.as_str(), name.as_str());
        let (handle, deliveries) = Subscription::new(key);
        self.inner.registry.register(Arc::clone(&handle));
        self.deliveries
            .insert(name.clone(), WatchStream::from_changes(deliveries));
        debug!("Registered subscription: key={}", handle.key());

        self.subscriptions.insert(
            name,
            StreamSubscription {
                resource,
                handle: Arc::clone(&handle),
                parked: None,
            },
        );
        handle
    }

    async fn on_nack(&mut self, nonce: &str, _message: &str) -> Result<(), Exit> {
        self.inner.metrics.record_update_failure();

        // Only a NACK of the last response sent on a key settles it.
        let target = self
            .subscriptions
            .iter()
            .find(|(_, subscription)| subscription.handle.sent_nonce_matches(nonce));
        let Some((name, subscription)) = target else {
            warn!(
                "SDS NACK for unknown or stale nonce: nonce={}, error={}",
                nonce, _message
            );
            return Ok(());
        };

        warn!(
            "SDS NACK: key={}, nonce={}, error={}",
            subscription.handle.key(),
            nonce,
            _message
        );
        subscription.handle.reject();
        subscription.handle.touch();

        let name = name.clone();
        match self.take_parked(&name) {
            Some(item) => self.send_secret(&name, item).await,
            None => Ok(()),
        }
    }

    fn unsubscribe(&mut self, connection: &Connection, nonce: &str) {
        let matched = self
            .subscriptions
            .iter()
            .find(|(_, subscription)| subscription.handle.sent_nonce_matches(nonce))
            .map(|(name, _)| name.clone());
        let names: Vec<String> = match matched {
            Some(name) => vec![name],
            None => self.subscriptions.keys().cloned().collect(),
        };

        for name in names {
            info!(
                "Unsubscribed: conn={}, resource={}",
                connection.connection_id, name
            );
            self.remove_subscription(&name);
        }
    }

    async fn on_delivery(&mut self, name: String, delivery: Delivery) -> Result<(), Exit> {
        match delivery {
            Delivery::Idle => Ok(()),
            Delivery::Secret(item) => {
                let Some(subscription) = self.subscriptions.get_mut(&name) else {
                    return Ok(());
                };
                subscription.handle.touch();
                if subscription.handle.has_sent_version(item.version()) {
                    debug!(
                        "Skipping push of a version already sent: key={}, version={}",
                        subscription.handle.key(),
                        item.version()
                    );
                    return Ok(());
                }
                if subscription.handle.is_in_flight() {
                    debug!(
                        "Parking push until the response in flight settles: key={}, version={}",
                        subscription.handle.key(),
                        item.version()
                    );
                    subscription.parked = Some(item);
                    return Ok(());
                }
                self.send_secret(&name, item).await
            }
            Delivery::Tombstone => Err(Exit::Closed(CloseReason::Tombstone)),
            Delivery::Closed => {
                self.remove_subscription(&name);
                if self.subscriptions.is_empty() {
                    return Err(Exit::Closed(CloseReason::Recycled));
                }
                Ok(())
            }
        }
    }

    async fn send_secret(&mut self, name: &str, item: Arc<SecretItem>) -> Result<(), Exit> {
        let Some(subscription) = self.subscriptions.get(name) else {
            return Ok(());
        };
        let response = secret_response(&subscription.resource, &item);
        subscription.handle.mark_sent(&response.nonce, item.version());
        subscription.handle.touch();
        let _key = subscription.handle.key().clone();

        self.responses
            .send(Ok(response))
            .await
            .map_err(|_| Exit::Closed(CloseReason::ClientGone))?;
        self.inner.metrics.record_push();
        info!("Pushed secret: key={}, version={}", _key, item.version());
        Ok(())
    }

    /// Takes the parked push of `name` unless its version was already sent meanwhile.
    fn take_parked(&mut self, name: &str) -> Option<Arc<SecretItem>> {
        let subscription = self.subscriptions.get_mut(name)?;
        let item = subscription.parked.take()?;
        if subscription.handle.has_sent_version(item.version()) {
            debug!(
                "Dropping parked push of a version already sent: key={}, version={}",
                subscription.handle.key(),
                item.version()
            );
            return None;
        }
        Some(item)
    }

    fn remove_subscription(&mut self, name: &str) {
        self.deliveries.remove(name);
        if let Some(subscription) = self.subscriptions.remove(name) {
            self.inner.registry.deregister_handle(&subscription.handle);
            self.inner
                .provider
                .delete(subscription.handle.key().connection_id(), name);
            debug!("Removed subscription: key={}", subscription.handle.key());
        }
    }

    async fn teardown(mut self, exit: Exit) {
        let names: Vec<String> = self.subscriptions.keys().cloned().collect();
        for name in names {
            self.remove_subscription(&name);
        }

        let _conn = self
            .connection
            .as_ref()
            .map_or("<none>", |connection| connection.connection_id.as_str());
        match exit {
            Exit::Closed(_reason) => {
                info!(
                    "SDS stream closed: conn={}, reason={}",
                    _conn,
                    _reason.as_str()
                );
            }
            Exit::Failed(err) => {
                warn!("SDS stream failed: conn={}, error={}", _conn, err);
                let _ = self.responses.send(Err(err.into())).await;
            }
        }
    }
}
