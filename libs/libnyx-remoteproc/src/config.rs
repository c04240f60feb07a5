//! Transport session configuration

use crate::message::{HeapId, Timeout, MAX_PAYLOAD};
use crate::platform::AddrKind;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Boot core (MultiProc name)
    #[serde(default = "default_core")]
    pub core: String,

    /// Application core started after the boot core
    #[serde(default = "default_app_core")]
    pub app_core: Option<String>,

    /// How the remote images get onto the cores
    #[serde(default)]
    pub boot: BootMode,

    /// Image for the boot core (`load` mode)
    #[serde(default)]
    pub core_image: Option<PathBuf>,

    /// Image for the application core (`load` mode)
    #[serde(default)]
    pub app_image: Option<PathBuf>,

    /// Notification region, registered at index 0
    #[serde(default = "default_notify_region")]
    pub notify_region: RegionConfig,

    /// Payload region, registered at index 1
    #[serde(default = "default_data_region")]
    pub data_region: RegionConfig,

    /// Address spaces the region bases are translated between
    #[serde(default)]
    pub translation: Translation,

    /// Local receive queue name
    #[serde(default = "default_local_queue")]
    pub local_queue: String,

    /// Queue created by the remote application core
    #[serde(default = "default_remote_queue")]
    pub remote_queue: String,

    /// MessageQ heap messages are allocated from
    #[serde(default)]
    pub heap_id: HeapId,

    /// Payload size of every message
    #[serde(default = "default_message_size")]
    pub message_size: usize,

    /// Data messages exchanged per run
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Give up on a reply after this many milliseconds (unset = wait
    /// forever)
    #[serde(default)]
    pub reply_timeout_ms: Option<u64>,

    /// Send the terminate sentinel after the exchange loop
    #[serde(default = "default_true")]
    pub shutdown_sentinel: bool,

    /// Remote queue rendezvous policy
    #[serde(default)]
    pub rendezvous: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            core: default_core(),
            app_core: default_app_core(),
            boot: BootMode::default(),
            core_image: None,
            app_image: None,
            notify_region: default_notify_region(),
            data_region: default_data_region(),
            translation: Translation::default(),
            local_queue: default_local_queue(),
            remote_queue: default_remote_queue(),
            heap_id: 0,
            message_size: default_message_size(),
            iterations: default_iterations(),
            reply_timeout_ms: None,
            shutdown_sentinel: true,
            rendezvous: RetryPolicy::default(),
        }
    }
}

/// How remote images are brought up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    /// A daemon loaded and started the cores; never start or stop them
    Daemon,
    /// Images are preloaded; start at entry point 0
    #[default]
    Start,
    /// Load the configured images, then start them
    Load,
}

/// Shared memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Base address, in the `translation.from` space
    pub base: u32,
    pub size: u32,
}

/// Source and destination spaces for region translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    #[serde(default = "default_from")]
    pub from: AddrKind,
    #[serde(default = "default_to")]
    pub to: AddrKind,
}

impl Default for Translation {
    fn default() -> Self {
        Self {
            from: default_from(),
            to: default_to(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_core() -> String {
    "SysM3".to_string()
}

fn default_app_core() -> Option<String> {
    Some("AppM3".to_string())
}

fn default_notify_region() -> RegionConfig {
    RegionConfig {
        base: 0x9850_0000,
        size: 0x4000,
    }
}

fn default_data_region() -> RegionConfig {
    RegionConfig {
        base: 0x9854_0000,
        size: 0x5_4000,
    }
}

fn default_from() -> AddrKind {
    AddrKind::MasterUsrVirt
}

fn default_to() -> AddrKind {
    AddrKind::SlaveVirt
}

fn default_local_queue() -> String {
    "MQ_MPU".to_string()
}

fn default_remote_queue() -> String {
    "MQ_CORE1".to_string()
}

fn default_message_size() -> usize {
    64
}

fn default_iterations() -> u32 {
    3
}

impl SessionConfig {
    /// Receive timeout for replies
    pub fn reply_timeout(&self) -> Timeout {
        match self.reply_timeout_ms {
            Some(ms) => Timeout::After(Duration::from_millis(ms)),
            None => Timeout::Forever,
        }
    }

    /// Reject configurations no session could run with
    pub fn validate(&self) -> Result<()> {
        if self.message_size == 0 || self.message_size > MAX_PAYLOAD {
            return Err(Error::Config(format!(
                "message_size must be within 1..={}, got {}",
                MAX_PAYLOAD, self.message_size
            )));
        }
        if self.notify_region.size == 0 || self.data_region.size == 0 {
            return Err(Error::Config("shared regions must be non-empty".into()));
        }
        if self.local_queue == self.remote_queue {
            return Err(Error::Config(format!(
                "local and remote queue share the name {}",
                self.local_queue
            )));
        }
        if self.boot == BootMode::Load {
            if self.core_image.is_none() {
                return Err(Error::Config("load mode needs core_image".into()));
            }
            if self.app_core.is_some() && self.app_image.is_none() {
                return Err(Error::Config("load mode needs app_image".into()));
            }
        }
        Ok(())
    }
}
