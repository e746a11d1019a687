//! SDS server: socket lifecycle, shared state and the tonic service.
//!
//! An [`SdsServer`] owns the [`SubscriptionRegistry`], the [`SecretProvider`], the metrics
//! recorder and the credential token source. [`SdsServer::start`] binds one Unix domain
//! socket per enabled mode, serves `SecretDiscoveryService` on each and runs the
//! stale-connection reaper. [`SdsServer::shutdown`] cancels every task, waits for them and
//! removes the socket files.
//!
//! Secrets reach proxies through the [`PushDispatcher`] returned by
//! [`SdsServer::dispatcher`].

mod builder;
mod response;
mod service;
mod stream;

pub use builder::SdsServerBuilder;
pub use service::SdsService;

use crate::config::SdsOptions;
use crate::credentials::TokenSource;
use crate::error::{ConfigError, SdsError};
use crate::metrics::MetricsRecorder;
use crate::prelude::{debug, error, info, warn};
use crate::reaper::StaleConnectionReaper;
use crate::registry::{PushDispatcher, SubscriptionRegistry};
use crate::resource::SdsMode;
use crate::secret::SecretProvider;
use envoy_types::pb::envoy::service::secret::v3::{
    secret_discovery_service_server::SecretDiscoveryServiceServer,
};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

pub(crate) struct ServerInner {
    pub(crate) options: SdsOptions,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) provider: Arc<dyn SecretProvider>,
    pub(crate) metrics: Arc<dyn MetricsRecorder>,
    pub(crate) token_source: TokenSource,
    pub(crate) shutdown: CancellationToken,
    next_connection: AtomicU64,
}

impl ServerInner {
    /// `<proxy id>-<n>`, unique per server.
    pub(crate) fn next_connection_id(&self, proxy_id: &str) -> String {
        let n = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{proxy_id}-{n}")
    }
}

/// Local SDS server.
///
/// Dropping the server cancels its background tasks without waiting for them; call
/// [`SdsServer::shutdown`] to wait and clean up socket files.
pub struct SdsServer {
    inner: Arc<ServerInner>,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sockets: Mutex<Vec<PathBuf>>,
}

impl fmt::Debug for SdsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdsServer")
            .field("options", &self.inner.options)
            .field("token_source", &self.inner.token_source)
            .field("subscriptions", &self.inner.registry.len())
            .field("started", &self.started.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SdsServer {
    /// Returns a builder serving secrets from `provider`.
    pub fn builder(provider: Arc<dyn SecretProvider>) -> SdsServerBuilder {
        SdsServerBuilder::new(provider)
    }

    pub(crate) fn new(
        options: SdsOptions,
        provider: Arc<dyn SecretProvider>,
        metrics: Arc<dyn MetricsRecorder>,
        token_source: TokenSource,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                options,
                registry: Arc::new(SubscriptionRegistry::new()),
                provider,
                metrics,
                token_source,
                shutdown: CancellationToken::new(),
                next_connection: AtomicU64::new(0),
            }),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
        }
    }

    /// Effective options.
    pub fn options(&self) -> &SdsOptions {
        &self.inner.options
    }

    /// Live subscriptions.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    /// Entry point for pushing secrets to subscribed proxies.
    pub fn dispatcher(&self) -> PushDispatcher {
        PushDispatcher::new(Arc::clone(&self.inner.registry))
    }

    /// Reaper over this server's registry, for manual sweeps.
    pub fn reaper(&self) -> StaleConnectionReaper {
        StaleConnectionReaper::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.metrics),
            self.inner.options.recycle_interval,
        )
    }

    /// tonic service for `mode`, to mount on a caller-managed server.
    pub fn service(&self, mode: SdsMode) -> SecretDiscoveryServiceServer<SdsService> {
        SecretDiscoveryServiceServer::new(SdsService::new(Arc::clone(&self.inner), mode))
    }

    /// Returns `true` once [`SdsServer::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Binds the configured sockets and starts serving.
    ///
    /// Stale socket files left at the configured paths are removed first. Every socket is
    /// bound before anything is served; if one fails, the sockets already bound are removed
    /// and `start` may be retried. Calling `start` again after a successful start has no
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NothingEnabled`] if no mode is enabled,
    /// [`SdsError::Socket`] if a socket cannot be bound, or [`SdsError::ServerClosed`]
    /// after [`SdsServer::shutdown`].
    pub async fn start(&self) -> Result<(), SdsError> {
        let options = &self.inner.options;
        let mut enabled = Vec::new();
        if options.enable_workload_sds {
            enabled.push((SdsMode::Workload, &options.workload_uds_path));
        }
        if options.enable_gateway_sds {
            enabled.push((SdsMode::Gateway, &options.gateway_uds_path));
        }
        if enabled.is_empty() {
            return Err(ConfigError::NothingEnabled.into());
        }
        let enabled = enabled
            .into_iter()
            .map(|(mode, path)| {
                path.as_deref()
                    .map(|path| (mode, path))
                    .ok_or(ConfigError::MissingSocketPath { mode: mode.as_str() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tasks = self.tasks.lock().await;
        // Under the same lock shutdown takes the task list with.
        if self.is_closed() {
            return Err(SdsError::ServerClosed);
        }
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut listeners = Vec::with_capacity(enabled.len());
        for (mode, path) in enabled {
            match bind_socket(path).await {
                Ok(listener) => listeners.push((mode, path, listener)),
                Err(err) => {
                    for (_, path, _) in &listeners {
                        remove_socket(path).await;
                    }
                    return Err(err);
                }
            }
        }

        let mut sockets = self.sockets.lock().await;
        for (mode, path, listener) in listeners {
            info!("SDS server listening: mode={}, path={}", mode, path.display());
            sockets.push(path.to_path_buf());
            tasks.push(self.spawn_listener(mode, listener));
        }
        let reaper = self.reaper();
        tasks.push(tokio::spawn(reaper.run(self.inner.shutdown.clone())));
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn spawn_listener(&self, mode: SdsMode, listener: UnixListener) -> JoinHandle<()> {
        let service = self.service(mode);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let signal = async move { shutdown.cancelled().await };
            let result = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal)
                .await;
            match result {
                Ok(()) => debug!("SDS server stopped: mode={}", mode),
                Err(_e) => error!("SDS server failed: mode={}, error={}", mode, _e),
            }
        })
    }

    /// Stops serving, ends every open stream and waits for background tasks.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(_e) = task.await {
                warn!("Error joining SDS task during shutdown: error={}", _e);
            }
        }

        for path in self.sockets.lock().await.drain(..) {
            remove_socket(&path).await;
        }
        info!("SDS server shut down");
    }
}

impl Drop for SdsServer {
    fn drop(&mut self) {
        // Best-effort cancellation. Do not block in Drop.
        self.inner.shutdown.cancel();
    }
}

async fn bind_socket(path: &Path) -> Result<UnixListener, SdsError> {
    let socket_error = |source| SdsError::Socket {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(socket_error)?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed stale SDS socket: path={}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(socket_error(err)),
    }
    UnixListener::bind(path).map_err(socket_error)
}

async fn remove_socket(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(_err) => warn!(
            "Failed to remove SDS socket: path={}, error={}",
            path.display(),
            _err
        ),
    }
}
