//! Error types for the SDS agent.

use crate::credentials::CredentialError;
use crate::secret::ProviderError;
use std::path::PathBuf;
use thiserror::Error;
use tonic::Status;

/// Errors produced while serving SDS requests or running the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SdsError {
    /// The request metadata carries no credential token.
    #[error("no credential token found in request metadata ({header})")]
    MissingToken {
        /// Metadata key that was inspected.
        header: &'static str,
    },

    /// The credential token metadata is malformed.
    #[error("invalid credential token metadata: {0}")]
    InvalidToken(String),

    /// A credential source produced an empty token.
    #[error("unexpected token \"\"")]
    EmptyToken,

    /// The credential fetcher failed.
    #[error("failed to fetch credential token: {0}")]
    Credential(#[from] CredentialError),

    /// The first request of a stream (or a unary request) carries no node identity.
    #[error("discovery request is missing node identity")]
    MissingNode,

    /// A unary request names no resource.
    #[error("discovery request has no resourceNames")]
    MissingResourceName,

    /// A request names more than one resource.
    #[error("discovery request has more than one resourceNames [{}]", .0.join(" "))]
    MultipleResourceNames(Vec<String>),

    /// A unary request names a resource this server does not serve.
    #[error("unknown SDS resource {0:?}")]
    UnknownResource(String),

    /// The secret provider failed to produce a secret.
    #[error("failed to generate secret {resource:?}: {source}")]
    Generation {
        /// Requested resource name.
        resource: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },

    /// The server configuration is invalid.
    #[error("invalid SDS configuration: {0}")]
    Config(#[from] ConfigError),

    /// A Unix domain socket could not be prepared or bound.
    #[error("failed to bind SDS socket {}: {source}", .path.display())]
    Socket {
        /// Socket path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The server was started after [`SdsServer::shutdown`](crate::SdsServer::shutdown).
    #[error("SDS server is shut down")]
    ServerClosed,
}

impl SdsError {
    pub(crate) fn generation(resource: &str, source: ProviderError) -> Self {
        Self::Generation {
            resource: resource.to_owned(),
            source,
        }
    }

    /// Returns `true` for failures caused by missing or rejected credentials.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::MissingToken { .. }
                | Self::InvalidToken(_)
                | Self::EmptyToken
                | Self::Credential(_)
                | Self::Generation {
                    source: ProviderError::Auth(_),
                    ..
                }
        )
    }
}

impl From<SdsError> for Status {
    fn from(err: SdsError) -> Self {
        let message = err.to_string();
        if err.is_auth() {
            return Status::unauthenticated(message);
        }
        match err {
            SdsError::MissingNode
            | SdsError::MissingResourceName
            | SdsError::MultipleResourceNames(_) => Status::invalid_argument(message),
            SdsError::UnknownResource(_) => Status::not_found(message),
            _ => Status::internal(message),
        }
    }
}

/// Invalid [`SdsOptions`](crate::SdsOptions) or builder input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A mode is enabled without a socket path.
    #[error("{mode} SDS is enabled but no UDS path is configured")]
    MissingSocketPath {
        /// `workload` or `gateway`.
        mode: &'static str,
    },

    /// The reaper interval is zero.
    #[error("recycle interval must be greater than zero")]
    ZeroRecycleInterval,

    /// `use_local_jwt` is set without a fetcher or a JWT path.
    #[error("local JWT is enabled but neither a credential fetcher nor a JWT path is configured")]
    MissingCredentialFetcher,

    /// No listener is enabled.
    #[error("neither workload nor gateway SDS is enabled")]
    NothingEnabled,
}
