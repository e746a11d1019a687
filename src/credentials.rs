//! Credential tokens presented to the secret provider.
//!
//! The token comes from one of three places:
//! - the `authorization` metadata of the SDS call (default),
//! - a [`CredentialFetcher`] when local JWTs are enabled,
//! - nowhere, when certificates are file-mounted and no token is required.

use crate::constants::{BEARER_PREFIX, CREDENTIAL_TOKEN_HEADER};
use crate::error::SdsError;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tonic::metadata::MetadataMap;

/// Future returned by [`CredentialFetcher::fetch_token`].
pub type TokenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send + 'a>>;

/// Errors produced by credential fetchers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// The token file could not be read.
    #[error("failed to read token file {}: {source}", .path.display())]
    Io {
        /// Token file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Any other fetcher failure.
    #[error("{0}")]
    Fetch(String),
}

/// Source of platform credential tokens.
pub trait CredentialFetcher: Send + Sync + 'static {
    /// Returns the current token.
    fn fetch_token(&self) -> TokenFuture<'_>;

    /// Short label used in logs.
    fn kind(&self) -> &'static str {
        "custom"
    }
}

/// Reads a JWT from a local file on every fetch, so rotated tokens are picked up.
#[derive(Debug, Clone)]
pub struct JwtFileFetcher {
    path: PathBuf,
}

impl JwtFileFetcher {
    /// Creates a fetcher reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Token file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialFetcher for JwtFileFetcher {
    fn fetch_token(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            let raw = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| CredentialError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            Ok(raw.trim().to_owned())
        })
    }

    fn kind(&self) -> &'static str {
        "jwt-file"
    }
}

/// Returns a fixed token.
#[derive(Clone)]
pub struct StaticTokenFetcher {
    token: String,
}

impl StaticTokenFetcher {
    /// Creates a fetcher returning `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenFetcher")
            .field("token_len", &self.token.len())
            .finish()
    }
}

impl CredentialFetcher for StaticTokenFetcher {
    fn fetch_token(&self) -> TokenFuture<'_> {
        let token = self.token.clone();
        Box::pin(async move { Ok(token) })
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

#[derive(Clone)]
pub(crate) enum TokenSource {
    Metadata,
    Fetcher(Arc<dyn CredentialFetcher>),
    FileMounted,
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => f.write_str("Metadata"),
            Self::Fetcher(fetcher) => write!(f, "Fetcher({})", fetcher.kind()),
            Self::FileMounted => f.write_str("FileMounted"),
        }
    }
}

impl TokenSource {
    pub(crate) async fn resolve(&self, metadata: &MetadataMap) -> Result<String, SdsError> {
        match self {
            Self::Metadata => {
                let token = token_from_metadata(metadata)?.ok_or(SdsError::MissingToken {
                    header: CREDENTIAL_TOKEN_HEADER,
                })?;
                non_empty(token)
            }
            Self::Fetcher(fetcher) => non_empty(fetcher.fetch_token().await?),
            Self::FileMounted => Ok(token_from_metadata(metadata)?.unwrap_or_default()),
        }
    }
}

fn non_empty(token: String) -> Result<String, SdsError> {
    if token.is_empty() {
        return Err(SdsError::EmptyToken);
    }
    Ok(token)
}

fn token_from_metadata(metadata: &MetadataMap) -> Result<Option<String>, SdsError> {
    let mut values = metadata.get_all(CREDENTIAL_TOKEN_HEADER).iter();
    let Some(value) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(SdsError::InvalidToken(format!(
            "{CREDENTIAL_TOKEN_HEADER} must carry exactly one value"
        )));
    }
    let raw = value.to_str().map_err(|_| {
        SdsError::InvalidToken(format!("{CREDENTIAL_TOKEN_HEADER} is not valid ASCII"))
    })?;
    let token = raw.strip_prefix(BEARER_PREFIX).unwrap_or(raw).trim();
    Ok(Some(token.to_owned()))
}
