//! Secret material handed to proxies, and the provider seam that produces it.
//!
//! A [`SecretItem`] is immutable once built and shared as `Arc<SecretItem>` between the
//! provider cache, the push dispatcher and every stream serving it.

mod provider;

pub use provider::{GenerateFuture, ProviderError, SecretProvider};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use time::macros::format_description;
use time::OffsetDateTime;
use zeroize::Zeroize;

/// PEM or DER encoded private key bytes.
///
/// This type is zeroized on drop and never prints its contents.
#[derive(Clone, Default, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// Returns the private key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if no key material is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for PrivateKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PrivateKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for PrivateKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Key material for one resource at one version.
///
/// Workload items carry a certificate chain and private key; root items carry only
/// `root_cert`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretItem {
    resource_name: String,
    certificate_chain: Vec<u8>,
    private_key: PrivateKey,
    root_cert: Vec<u8>,
    version: String,
    token: String,
    created_at: SystemTime,
}

impl SecretItem {
    /// Creates an empty item for `resource_name` at `version`.
    pub fn new(resource_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            certificate_chain: Vec::new(),
            private_key: PrivateKey::default(),
            root_cert: Vec::new(),
            version: version.into(),
            token: String::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Sets the certificate chain.
    #[must_use]
    pub fn with_certificate_chain(mut self, chain: impl Into<Vec<u8>>) -> Self {
        self.certificate_chain = chain.into();
        self
    }

    /// Sets the private key.
    #[must_use]
    pub fn with_private_key(mut self, key: impl Into<PrivateKey>) -> Self {
        self.private_key = key.into();
        self
    }

    /// Sets the trusted root certificate.
    #[must_use]
    pub fn with_root_cert(mut self, root: impl Into<Vec<u8>>) -> Self {
        self.root_cert = root.into();
        self
    }

    /// Records the credential token the item was generated for.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Overrides the creation time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: SystemTime) -> Self {
        self.created_at = created_at;
        self
    }

    /// Resource name this item was generated for.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Certificate chain bytes (empty for root items).
    pub fn certificate_chain(&self) -> &[u8] {
        &self.certificate_chain
    }

    /// Private key (empty for root items).
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Root certificate bytes (empty for workload items).
    pub fn root_cert(&self) -> &[u8] {
        &self.root_cert
    }

    /// Version string sent as `version_info`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Credential token the item was generated for.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Creation time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns `true` if the item carries only a root certificate.
    pub fn is_root(&self) -> bool {
        self.certificate_chain.is_empty() && !self.root_cert.is_empty()
    }
}

impl fmt::Debug for SecretItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretItem")
            .field("resource_name", &self.resource_name)
            .field("version", &self.version)
            .field("certificate_chain_len", &self.certificate_chain.len())
            .field("private_key", &self.private_key)
            .field("root_cert_len", &self.root_cert.len())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Result of comparing a requested version against the provider's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCheck {
    /// The cached secret matches the requested version and token.
    Hit,
    /// Nothing is cached for the key.
    MissAbsent,
    /// Something is cached but version or token differ.
    MissStale,
}

impl CacheCheck {
    /// Returns `true` for [`CacheCheck::Hit`].
    pub const fn is_hit(self) -> bool {
        matches!(self, Self::Hit)
    }

    /// Stable, low-cardinality label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::MissAbsent => "miss_absent",
            Self::MissStale => "miss_stale",
        }
    }
}

impl fmt::Display for CacheCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces unique, timestamp-derived version strings for generated secrets.
///
/// Versions look like `10-19 08:15:02.731/42`; the trailing sequence number keeps two
/// versions minted within the same millisecond distinct.
#[derive(Debug, Default)]
pub struct VersionClock {
    seq: AtomicU64,
}

impl VersionClock {
    /// Creates a clock starting at sequence zero.
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Returns the next version.
    pub fn next_version(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .unwrap_or_default();
        format!("{stamp}/{seq}")
    }
}
