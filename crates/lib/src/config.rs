//! # Installer configuration
//!
//! Read from TOML. Every key is optional; a missing file means all
//! defaults.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::service_observer::SERVICE_ACTIVATION_TIMEOUT;
use crate::subscription::system_purpose::VALID_FIELDS_FILE_PATH;

/// The default configuration file.
pub const CONFIG_PATH: &str = "/etc/instconf/config.toml";

/// The top level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct InstallerConfig {
    /// Where the installed system is mounted.
    pub sysroot: Utf8PathBuf,
    /// The root of the installation environment.
    pub source_root: Utf8PathBuf,
    /// Subscription settings.
    pub subscription: SubscriptionConfig,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            sysroot: "/mnt/sysroot".into(),
            source_root: "/".into(),
            subscription: SubscriptionConfig::default(),
        }
    }
}

/// The `[subscription]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SubscriptionConfig {
    /// The system purpose whitelist.
    pub valid_fields_path: Utf8PathBuf,
    /// How long to wait for RHSM to show up on the bus.
    pub activation_timeout_secs: u64,
    /// Connect the installed system to Red Hat Insights.
    pub connect_to_insights: bool,
    /// Copy the subscription tokens into the installed system.
    pub transfer_subscription_tokens: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            valid_fields_path: VALID_FIELDS_FILE_PATH.into(),
            activation_timeout_secs: SERVICE_ACTIVATION_TIMEOUT.as_secs(),
            connect_to_insights: false,
            transfer_subscription_tokens: true,
        }
    }
}

impl SubscriptionConfig {
    /// See [`Self::activation_timeout_secs`].
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }
}

impl InstallerConfig {
    /// Parse a configuration from TOML.
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).context("Parsing configuration")
    }

    /// Load the configuration at `path`; a missing file yields the defaults.
    #[context("Loading configuration from {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(buf) => Self::from_toml(&buf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {path}, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
