use super::SdsServer;
use crate::config::SdsOptions;
use crate::credentials::{CredentialFetcher, JwtFileFetcher, TokenSource};
use crate::error::{ConfigError, SdsError};
use crate::metrics::{MetricsRecorder, SdsMetrics};
use crate::secret::SecretProvider;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`SdsServer`].
///
/// # Example
///
/// ```no_run
/// use sds_agent::{SdsMetrics, SdsServer, SecretProvider};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # type BoxError = Box<dyn std::error::Error>;
/// # async fn example(provider: Arc<dyn SecretProvider>) -> Result<(), BoxError> {
/// let metrics = Arc::new(SdsMetrics::new());
/// let server = SdsServer::builder(provider)
///     .workload_socket("/var/run/sds/workload.sock")
///     .recycle_interval(Duration::from_secs(60))
///     .metrics(metrics.clone())
///     .build()?;
/// server.start().await?;
///
/// // ...
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SdsServerBuilder {
    options: SdsOptions,
    provider: Arc<dyn SecretProvider>,
    credential_fetcher: Option<Arc<dyn CredentialFetcher>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl Debug for SdsServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdsServerBuilder")
            .field("options", &self.options)
            .field("provider", &"<SecretProvider>")
            .field(
                "credential_fetcher",
                &self.credential_fetcher.as_ref().map(|fetcher| fetcher.kind()),
            )
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl SdsServerBuilder {
    /// Creates a builder with default options around `provider`.
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            options: SdsOptions::default(),
            provider,
            credential_fetcher: None,
            metrics: None,
        }
    }

    /// Replaces all options.
    #[must_use]
    pub fn options(mut self, options: SdsOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables workload SDS on `path`.
    #[must_use]
    pub fn workload_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.enable_workload_sds = true;
        self.options.workload_uds_path = Some(path.into());
        self
    }

    /// Enables gateway SDS on `path`.
    #[must_use]
    pub fn gateway_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.enable_gateway_sds = true;
        self.options.gateway_uds_path = Some(path.into());
        self
    }

    /// Sets the stale-connection recycle interval.
    #[must_use]
    pub const fn recycle_interval(mut self, interval: Duration) -> Self {
        self.options.recycle_interval = interval;
        self
    }

    /// Marks certificates as file-mounted: requests without a credential token are served.
    #[must_use]
    pub const fn file_mounted_certs(mut self, enabled: bool) -> Self {
        self.options.file_mounted_certs = enabled;
        self
    }

    /// Takes credential tokens from `fetcher` instead of request metadata.
    ///
    /// Implies `use_local_jwt`.
    #[must_use]
    pub fn credential_fetcher(mut self, fetcher: Arc<dyn CredentialFetcher>) -> Self {
        self.options.use_local_jwt = true;
        self.credential_fetcher = Some(fetcher);
        self
    }

    /// Sets the metrics recorder. Defaults to a private [`SdsMetrics`].
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration and creates a server that is not listening yet.
    ///
    /// # Errors
    ///
    /// Returns [`SdsError::Config`] if the options are inconsistent or local JWTs are
    /// enabled without a fetcher or JWT path.
    pub fn build(self) -> Result<SdsServer, SdsError> {
        self.options.validate()?;

        let token_source = if self.options.use_local_jwt {
            let fetcher: Arc<dyn CredentialFetcher> =
                match (self.credential_fetcher, &self.options.jwt_path) {
                    (Some(fetcher), _) => fetcher,
                    (None, Some(path)) => Arc::new(JwtFileFetcher::new(path.clone())),
                    (None, None) => return Err(ConfigError::MissingCredentialFetcher.into()),
                };
            TokenSource::Fetcher(fetcher)
        } else if self.options.file_mounted_certs {
            TokenSource::FileMounted
        } else {
            TokenSource::Metadata
        };

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(SdsMetrics::new()) as Arc<dyn MetricsRecorder>);

        Ok(SdsServer::new(self.options, self.provider, metrics, token_source))
    }

    /// Builds the server and starts listening.
    ///
    /// # Errors
    ///
    /// See [`SdsServerBuilder::build`] and [`SdsServer::start`].
    pub async fn serve(self) -> Result<SdsServer, SdsError> {
        let server = self.build()?;
        server.start().await?;
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticTokenFetcher;
    use crate::secret::{CacheCheck, GenerateFuture, ProviderError};

    struct NoProvider;

    impl SecretProvider for NoProvider {
        fn generate<'a>(&'a self, _: &'a str, _: &'a str, _: &'a str) -> GenerateFuture<'a> {
            Box::pin(async { Err(ProviderError::Generation("unavailable".to_string())) })
        }

        fn check(&self, _: &str, _: &str, _: &str, _: &str) -> CacheCheck {
            CacheCheck::MissAbsent
        }

        fn delete(&self, _: &str, _: &str) {}
    }

    fn builder() -> SdsServerBuilder {
        SdsServerBuilder::new(Arc::new(NoProvider))
    }

    #[test]
    fn token_source_selection() {
        let server = builder().build().unwrap();
        assert!(matches!(server.inner.token_source, TokenSource::Metadata));

        let server = builder().file_mounted_certs(true).build().unwrap();
        assert!(matches!(server.inner.token_source, TokenSource::FileMounted));

        let server = builder()
            .credential_fetcher(Arc::new(StaticTokenFetcher::new("token")))
            .build()
            .unwrap();
        assert!(matches!(server.inner.token_source, TokenSource::Fetcher(_)));
        assert!(server.options().use_local_jwt);

        let server = builder()
            .options(SdsOptions {
                use_local_jwt: true,
                jwt_path: Some(PathBuf::from("/var/run/secrets/token")),
                ..SdsOptions::default()
            })
            .build()
            .unwrap();
        match &server.inner.token_source {
            TokenSource::Fetcher(fetcher) => assert_eq!(fetcher.kind(), "jwt-file"),
            other => panic!("unexpected token source: {other:?}"),
        }
    }

    #[test]
    fn local_jwt_without_fetcher_is_rejected() {
        let err = builder()
            .options(SdsOptions {
                use_local_jwt: true,
                ..SdsOptions::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            SdsError::Config(ConfigError::MissingCredentialFetcher)
        ));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let err = builder()
            .recycle_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, SdsError::Config(ConfigError::ZeroRecycleInterval)));
    }

    #[test]
    fn socket_setters_enable_modes() {
        let builder = builder()
            .workload_socket("/tmp/workload.sock")
            .gateway_socket("/tmp/gateway.sock");
        assert!(builder.options.enable_workload_sds);
        assert!(builder.options.enable_gateway_sds);
        assert_eq!(
            builder.options.gateway_uds_path,
            Some(PathBuf::from("/tmp/gateway.sock"))
        );
    }
}
