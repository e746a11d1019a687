//! Resource naming: subscription keys and the well-known resource aliases.

use crate::constants::{
    FILE_ROOT_PREFIX, GATEWAY_CA_SUFFIX, ROOT_CA_RESOURCE, WORKLOAD_CERT_RESOURCE,
};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of one subscription: a client stream and the resource it asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    connection_id: String,
    resource_name: String,
}

impl SubscriptionKey {
    /// Creates a key.
    pub fn new(connection_id: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            resource_name: resource_name.into(),
        }
    }

    /// Connection id (`<node id>-<n>`).
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Requested resource name.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection_id, self.resource_name)
    }
}

/// Which socket a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdsMode {
    /// Sidecar workload SDS: only the well-known aliases are served.
    Workload,
    /// Gateway SDS: arbitrary credential names are served.
    Gateway,
}

impl SdsMode {
    /// Stable label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Workload => "workload",
            Self::Gateway => "gateway",
        }
    }
}

impl fmt::Display for SdsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a requested resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// `default`: workload certificate chain and key.
    WorkloadCertificate,
    /// `ROOTCA`: trusted root.
    RootCa,
    /// `file-root:<absolute path>`: root certificate read from the local filesystem.
    FileRoot(PathBuf),
    /// Any other name.
    Other,
}

/// A requested resource name together with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    name: String,
    kind: ResourceKind,
}

impl Resource {
    /// Classifies `name`.
    ///
    /// `file-root:` names with a relative path are classified as [`ResourceKind::Other`].
    pub fn parse(name: &str) -> Self {
        let kind = match name {
            WORKLOAD_CERT_RESOURCE => ResourceKind::WorkloadCertificate,
            ROOT_CA_RESOURCE => ResourceKind::RootCa,
            _ => match name.strip_prefix(FILE_ROOT_PREFIX).map(Path::new) {
                Some(path) if path.is_absolute() => ResourceKind::FileRoot(path.to_path_buf()),
                _ => ResourceKind::Other,
            },
        };
        Self {
            name: name.to_owned(),
            kind,
        }
    }

    /// Resource name as requested.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classification.
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Returns `true` if the resource is encoded as a validation context.
    pub fn is_root(&self) -> bool {
        match self.kind {
            ResourceKind::RootCa | ResourceKind::FileRoot(_) => true,
            ResourceKind::WorkloadCertificate => false,
            ResourceKind::Other => self.name.ends_with(GATEWAY_CA_SUFFIX),
        }
    }

    /// Returns `true` if a server in `mode` answers requests for this resource.
    pub fn is_served(&self, mode: SdsMode) -> bool {
        match mode {
            SdsMode::Workload => self.kind != ResourceKind::Other,
            SdsMode::Gateway => true,
        }
    }
}
