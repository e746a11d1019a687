//! Server options.

use crate::constants::DEFAULT_RECYCLE_INTERVAL;
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Options of an [`SdsServer`](crate::SdsServer).
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use sds_agent::SdsOptions;
/// use std::time::Duration;
///
/// let options: SdsOptions = serde_json::from_str(
///     r#"{
///         "enableWorkloadSds": true,
///         "workloadUdsPath": "/var/run/sds/uds_path",
///         "recycleInterval": 60
///     }"#,
/// )?;
/// assert_eq!(options.recycle_interval, Duration::from_secs(60));
/// assert!(options.validate().is_ok());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SdsOptions {
    /// Serve workload SDS on `workload_uds_path`.
    pub enable_workload_sds: bool,
    /// Unix socket of the workload SDS server.
    pub workload_uds_path: Option<PathBuf>,
    /// Serve gateway SDS on `gateway_uds_path`.
    pub enable_gateway_sds: bool,
    /// Unix socket of the gateway SDS server.
    pub gateway_uds_path: Option<PathBuf>,
    /// Idle time after which a subscription is reaped; also the reaper period.
    #[serde(with = "duration_secs")]
    pub recycle_interval: Duration,
    /// Take the credential token from a [`CredentialFetcher`](crate::CredentialFetcher)
    /// instead of request metadata.
    pub use_local_jwt: bool,
    /// JWT file read by the default fetcher when `use_local_jwt` is set.
    pub jwt_path: Option<PathBuf>,
    /// Certificates are mounted from files; a credential token is optional.
    pub file_mounted_certs: bool,
}

impl Default for SdsOptions {
    fn default() -> Self {
        Self {
            enable_workload_sds: false,
            workload_uds_path: None,
            enable_gateway_sds: false,
            gateway_uds_path: None,
            recycle_interval: DEFAULT_RECYCLE_INTERVAL,
            use_local_jwt: false,
            jwt_path: None,
            file_mounted_certs: false,
        }
    }
}

impl SdsOptions {
    /// Options serving workload SDS on `path`.
    pub fn workload(path: impl Into<PathBuf>) -> Self {
        Self {
            enable_workload_sds: true,
            workload_uds_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Checks the options for internal consistency.
    ///
    /// A missing credential fetcher is reported by the server builder, which knows whether
    /// one was supplied programmatically.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an enabled mode has no socket path or the recycle
    /// interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_workload_sds && self.workload_uds_path.is_none() {
            return Err(ConfigError::MissingSocketPath { mode: "workload" });
        }
        if self.enable_gateway_sds && self.gateway_uds_path.is_none() {
            return Err(ConfigError::MissingSocketPath { mode: "gateway" });
        }
        if self.recycle_interval.is_zero() {
            return Err(ConfigError::ZeroRecycleInterval);
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        f64::deserialize(deserializer).and_then(|secs| {
            Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
        })
    }
}
