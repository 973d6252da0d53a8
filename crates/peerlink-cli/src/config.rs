//! peerlink CLI configuration
//!
//! Configuration is read from a TOML file. Every section and field is
//! optional; anything missing falls back to the defaults below.
//!
//! ```toml
//! [identity]
//! identity = "laptop-1"
//! name = "laptop"
//! metadata_hex = "0102"
//!
//! [link]
//! task_timeout_ms = 2000
//! max_connect_retries = 3
//!
//! [demo]
//! peers = 3
//! messages = ["hello", "bye"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use peerlink_core::{GattStatus, PeerLinkConfig};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub link: LinkConfig,
    pub demo: DemoConfig,
}

/// What this device publishes about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Published identity; a random one is generated when unset
    pub identity: Option<String>,
    /// Advertised device name
    pub name: Option<String>,
    /// Published metadata, hex encoded
    pub metadata_hex: Option<String>,
}

/// Handshake and channel tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a radio request may wait for its callback (in milliseconds)
    pub task_timeout_ms: u64,
    pub max_connect_retries: u32,
    /// Connect status treated as transient
    pub retryable_status: u16,
    pub read_buffer_size: usize,
}

/// Settings for the in-process demo session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of simulated peers
    pub peers: usize,
    /// Messages sent to every peer
    pub messages: Vec<String>,
    /// How long to wait for each echo (in milliseconds)
    pub reply_timeout_ms: u64,
    /// Upper bound for the whole session (in milliseconds)
    pub session_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let defaults = PeerLinkConfig::default();
        Self {
            task_timeout_ms: defaults.task_timeout.as_millis() as u64,
            max_connect_retries: defaults.max_connect_retries,
            retryable_status: defaults.retryable_status.0,
            read_buffer_size: defaults.read_buffer_size,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            peers: 2,
            messages: vec!["hello".to_string()],
            reply_timeout_ms: 2000,
            session_timeout_ms: 10_000,
        }
    }
}

impl DemoConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Loading and Saving
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: AppConfig = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.demo.peers == 0 {
            return Err(CliError::Config("Demo needs at least one peer".to_string()));
        }
        if self.demo.peers > 200 {
            return Err(CliError::Config(format!(
                "Demo supports at most 200 peers, got {}",
                self.demo.peers
            )));
        }
        if self.demo.reply_timeout_ms == 0 || self.demo.session_timeout_ms == 0 {
            return Err(CliError::Config(
                "Demo timeouts must be greater than 0".to_string(),
            ));
        }

        self.to_link_config()?.validate()?;
        Ok(())
    }

    /// Build the library configuration for the local device
    pub fn to_link_config(&self) -> Result<PeerLinkConfig> {
        let mut config = PeerLinkConfig::new()
            .with_task_timeout(Duration::from_millis(self.link.task_timeout_ms))
            .with_max_connect_retries(self.link.max_connect_retries)
            .with_retryable_status(GattStatus(self.link.retryable_status))
            .with_read_buffer_size(self.link.read_buffer_size);

        if let Some(identity) = &self.identity.identity {
            config = config.with_local_identity(identity.clone());
        }
        if let Some(name) = &self.identity.name {
            config = config.with_local_name(name.clone());
        }
        if let Some(metadata) = &self.identity.metadata_hex {
            config = config.with_metadata(hex::decode(metadata)?);
        }
        Ok(config)
    }
}
