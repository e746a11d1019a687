#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Local Secret Discovery Service (SDS) server for Envoy-compatible proxies.
//!
//! The server listens on Unix domain sockets and serves workload certificates and root
//! CA bundles over the Envoy `SecretDiscoveryService` gRPC API, both as a long-lived
//! bidirectional stream and as a unary fetch. Key material comes from a pluggable
//! [`SecretProvider`]; the server owns the per-connection subscription state, pushes
//! rotated secrets to subscribed proxies and recycles stale connections.
//!
//! ```no_run
//! use sds_agent::{SdsServer, SecretItem, SecretProvider, SubscriptionKey};
//! use std::sync::Arc;
//!
//! # type BoxError = Box<dyn std::error::Error>;
//! # async fn example(provider: Arc<dyn SecretProvider>) -> Result<(), BoxError> {
//! let server = SdsServer::builder(provider)
//!     .workload_socket("/var/run/sds/workload.sock")
//!     .serve()
//!     .await?;
//!
//! // Push a rotated certificate to the proxy subscribed under this key.
//! let key = SubscriptionKey::new("sidecar~10.0.0.1~pod.ns~ns.svc.cluster.local-1", "default");
//! let rotated = SecretItem::new("default", "v2")
//!     .with_certificate_chain(b"chain".to_vec())
//!     .with_private_key(b"key".to_vec());
//! server.dispatcher().push(&key, Arc::new(rotated));
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`logging`** (default): diagnostics through the `log` facade
//! - **`tracing`**: diagnostics as `tracing` events; takes precedence over `logging`

mod observability;
mod prelude;

pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod reaper;
pub mod registry;
pub mod resource;
pub mod secret;
pub mod server;

// -----------------------
// Re-exports
// -----------------------

pub use crate::config::SdsOptions;
pub use crate::credentials::{
    CredentialError, CredentialFetcher, JwtFileFetcher, StaticTokenFetcher, TokenFuture,
};
pub use crate::error::{ConfigError, SdsError};
pub use crate::metrics::{MetricsRecorder, MetricsSnapshot, SdsMetrics};
pub use crate::reaper::StaleConnectionReaper;
pub use crate::registry::{
    DispatchOutcome, Push, PushDispatcher, Subscription, SubscriptionRegistry,
};
pub use crate::resource::{Resource, ResourceKind, SdsMode, SubscriptionKey};
pub use crate::secret::{
    CacheCheck, GenerateFuture, PrivateKey, ProviderError, SecretItem, SecretProvider,
    VersionClock,
};
pub use crate::server::{SdsServer, SdsServerBuilder, SdsService};
