//! Configuration for the pmtransport tool

use anyhow::Result;
use libnyx_remoteproc::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmTransportConfig {
    /// Log filter (`info`, `debug`, or an EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Transport session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Loopback remote settings
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

impl Default for PmTransportConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session: SessionConfig::default(),
            loopback: LoopbackConfig::default(),
        }
    }
}

/// Behaviour of the emulated remote side
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Failed queue opens before the remote queue appears
    #[serde(default)]
    pub queue_ready_after: u32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

impl PmTransportConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            config.session.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
