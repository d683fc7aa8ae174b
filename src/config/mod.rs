//! Engine configuration.
//!
//! All tunables live in one serde-backed record with per-field defaults; a
//! manager owns its configuration value and nothing is global. YAML loading
//! is synchronous on purpose so configuration is validated before any
//! scheduling begins.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::error::{CommsError, CommsResult};

/// Tunables for a [`CommsManager`](crate::scheduler::CommsManager).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    /// Maximum 301/302/303 hops followed per submission.
    #[serde(default = "EngineConfig::default_redirect_limit")]
    pub redirect_limit: u32,

    /// Maximum concurrently executing wire attempts.
    #[serde(default = "EngineConfig::default_max_concurrency")]
    #[validate(range(min = 1))]
    pub max_concurrency: usize,

    #[serde(default = "EngineConfig::default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    #[serde(default = "EngineConfig::default_read_timeout_ms")]
    #[validate(range(min = 1))]
    pub read_timeout_ms: u64,

    /// Accept invalid TLS certificates. Intended for test rigs only.
    #[serde(default)]
    pub disable_tls_verification: bool,

    /// Let the transport follow redirects itself instead of the scheduler
    /// orchestrating each hop.
    #[serde(default)]
    pub use_native_redirects: bool,

    /// How long a queued work waits between priority promotions.
    #[serde(default = "EngineConfig::default_promotion_interval_ms")]
    #[validate(range(min = 1))]
    pub promotion_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redirect_limit: Self::default_redirect_limit(),
            max_concurrency: Self::default_max_concurrency(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            read_timeout_ms: Self::default_read_timeout_ms(),
            disable_tls_verification: false,
            use_native_redirects: false,
            promotion_interval_ms: Self::default_promotion_interval_ms(),
        }
    }
}

impl EngineConfig {
    fn default_redirect_limit() -> u32 {
        3
    }
    fn default_max_concurrency() -> usize {
        2
    }
    fn default_connect_timeout_ms() -> u64 {
        30_000
    }
    fn default_read_timeout_ms() -> u64 {
        30_000
    }
    fn default_promotion_interval_ms() -> u64 {
        60_000
    }

    /// Loads configuration from a YAML file with validation.
    pub fn load_from_yaml<P>(path: P) -> CommsResult<Self>
    where
        P: AsRef<Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| CommsError::Configuration(format!("unable to read {path}: {e}")))?;
        log::debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Parses a YAML configuration string with validation.
    pub fn from_yaml(conf_str: &str) -> CommsResult<Self> {
        log::trace!("Read conf: {conf_str}");
        let conf: EngineConfig = serde_yaml::from_str(conf_str)
            .map_err(|e| CommsError::Configuration(format!("unable to parse yaml conf: {e}")))?;
        conf.validate()
            .map_err(|e| CommsError::Configuration(format!("conf validation failed: {e}")))?;
        log::trace!("Loaded conf: {conf:?}");
        Ok(conf)
    }
}
