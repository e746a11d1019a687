//! Well-known names used on the SDS wire.

use std::time::Duration;

/// Resource name of the workload certificate chain and private key.
pub const WORKLOAD_CERT_RESOURCE: &str = "default";

/// Resource name of the trusted root certificate (validation context).
pub const ROOT_CA_RESOURCE: &str = "ROOTCA";

/// Prefix of resource names that refer to a root certificate mounted on the local filesystem.
///
/// The remainder of the name must be an absolute path, e.g. `file-root:/etc/certs/root-cert.pem`.
pub const FILE_ROOT_PREFIX: &str = "file-root:";

/// Suffix of gateway credential names that carry only a CA certificate.
pub const GATEWAY_CA_SUFFIX: &str = "-cacert";

/// Type URL of the Envoy v3 TLS `Secret` resource.
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// gRPC metadata key carrying the caller's credential token.
pub const CREDENTIAL_TOKEN_HEADER: &str = "authorization";

/// Default interval of the stale-connection reaper.
pub const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub(crate) const BEARER_PREFIX: &str = "Bearer ";
