//! Discovery, handshake and server configuration

use std::time::Duration;

use uuid::Uuid;

use crate::error::{PeerLinkError, Result};
use crate::radio::GattStatus;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration shared by the discovery service and the local server
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerLinkConfig {
    /// Identity published through the identity characteristic
    pub local_identity: String,
    /// Name included in advertisements, if any
    pub local_name: Option<String>,
    /// Bytes published through the metadata characteristic
    pub metadata: Vec<u8>,
    /// How long the task throttle waits for a hardware callback
    pub task_timeout: Duration,
    /// Connect retries allowed after a transient fault
    pub max_connect_retries: u32,
    /// Status code treated as a transient connect fault
    pub retryable_status: GattStatus,
    /// Size of each data channel read
    pub read_buffer_size: usize,
}

impl Default for PeerLinkConfig {
    fn default() -> Self {
        Self {
            local_identity: generate_identity(),
            local_name: None,
            metadata: Vec::new(),
            task_timeout: Duration::from_secs(2),
            max_connect_retries: 3,
            retryable_status: GattStatus::TRANSIENT,
            read_buffer_size: 1024,
        }
    }
}

impl PeerLinkConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the published identity
    pub fn with_local_identity(mut self, identity: impl Into<String>) -> Self {
        self.local_identity = identity.into();
        self
    }

    /// Set the advertised name
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Set the published metadata bytes
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the task throttle callback timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the connect retry budget
    pub fn with_max_connect_retries(mut self, retries: u32) -> Self {
        self.max_connect_retries = retries;
        self
    }

    /// Set the status treated as a transient connect fault
    pub fn with_retryable_status(mut self, status: GattStatus) -> Self {
        self.retryable_status = status;
        self
    }

    /// Set the data channel read size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Check the configuration for values the radio layer cannot use
    pub fn validate(&self) -> Result<()> {
        if self.local_identity.is_empty() {
            return Err(PeerLinkError::configuration("local identity must not be empty"));
        }
        if self.task_timeout.is_zero() {
            return Err(PeerLinkError::configuration("task timeout must be positive"));
        }
        if self.read_buffer_size == 0 {
            return Err(PeerLinkError::configuration(
                "read buffer size must be positive",
            ));
        }
        if self.retryable_status.is_success() {
            return Err(PeerLinkError::configuration(
                "retryable status cannot be the success status",
            ));
        }
        Ok(())
    }
}

/// Random 6-digit identity for devices that do not configure one
pub fn generate_identity() -> String {
    format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_radio_expectations() {
        let config = PeerLinkConfig::default();
        assert_eq!(config.task_timeout, Duration::from_secs(2));
        assert_eq!(config.max_connect_retries, 3);
        assert_eq!(config.retryable_status, GattStatus::TRANSIENT);
        assert_eq!(config.read_buffer_size, 1024);
        assert!(config.metadata.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn generated_identity_is_six_digits() {
        let identity = generate_identity();
        assert_eq!(identity.len(), 6);
        assert!(identity.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn builders_override_defaults() {
        let config = PeerLinkConfig::new()
            .with_local_identity("peer-42")
            .with_local_name("phone")
            .with_task_timeout(Duration::from_millis(250))
            .with_max_connect_retries(1)
            .with_read_buffer_size(64);

        assert_eq!(config.local_identity, "peer-42");
        assert_eq!(config.local_name.as_deref(), Some("phone"));
        assert_eq!(config.task_timeout, Duration::from_millis(250));
        assert_eq!(config.max_connect_retries, 1);
        assert_eq!(config.read_buffer_size, 64);
    }

    #[test]
    fn validate_rejects_unusable_values() {
        assert!(PeerLinkConfig::new().with_local_identity("").validate().is_err());
        assert!(PeerLinkConfig::new()
            .with_task_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PeerLinkConfig::new().with_read_buffer_size(0).validate().is_err());
        assert!(PeerLinkConfig::new()
            .with_retryable_status(GattStatus::SUCCESS)
            .validate()
            .is_err());
    }
}
