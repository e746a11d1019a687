use super::{CacheCheck, SecretItem};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Future returned by [`SecretProvider::generate`].
pub type GenerateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<SecretItem>, ProviderError>> + Send + 'a>>;

/// Failure reported by a [`SecretProvider`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderError {
    /// The credential token was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The secret could not be produced (CA unreachable, key generation failed, ...).
    #[error("{0}")]
    Generation(String),
}

/// Produces and caches key material for subscriptions.
///
/// The server consults the provider for every served request and never generates or
/// signs anything itself. Implementations own their cache, keyed by
/// `(connection_id, resource_name)`, and must hand out strictly increasing versions for
/// newly generated secrets of the same key.
///
/// # Example
///
/// ```no_run
/// use sds_agent::{CacheCheck, GenerateFuture, SecretItem, SecretProvider};
/// use std::sync::Arc;
///
/// struct StaticRoot(Arc<SecretItem>);
///
/// impl SecretProvider for StaticRoot {
///     fn generate<'a>(
///         &'a self,
///         _conn: &'a str,
///         _resource: &'a str,
///         _token: &'a str,
///     ) -> GenerateFuture<'a> {
///         let item = Arc::clone(&self.0);
///         Box::pin(async move { Ok(item) })
///     }
///
///     fn check(&self, _conn: &str, _resource: &str, _token: &str, version: &str) -> CacheCheck {
///         if version == self.0.version() { CacheCheck::Hit } else { CacheCheck::MissStale }
///     }
///
///     fn delete(&self, _conn: &str, _resource: &str) {}
/// }
/// ```
pub trait SecretProvider: Send + Sync + 'static {
    /// Returns the current secret for `resource_name`, generating it if needed.
    fn generate<'a>(
        &'a self,
        connection_id: &'a str,
        resource_name: &'a str,
        token: &'a str,
    ) -> GenerateFuture<'a>;

    /// Compares the version a client holds against the cache.
    fn check(
        &self,
        connection_id: &str,
        resource_name: &str,
        token: &str,
        version: &str,
    ) -> CacheCheck;

    /// Drops the cached secret for a key whose subscription ended.
    fn delete(&self, connection_id: &str, resource_name: &str);

    /// Returns `true` if the request must wait for a secret supplied out of band
    /// (e.g. a gateway credential not created yet). The key stays subscribed and is served
    /// by the next push.
    fn should_defer_for_external_secret(
        &self,
        _connection_id: &str,
        _resource_name: &str,
        _token: &str,
        _file_mounted_only: bool,
    ) -> bool {
        false
    }
}
