//! Error types for peer discovery, handshake and data channels

use std::io;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::radio::GattStatus;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced to callers of the discovery service and local server
#[derive(Error, Debug)]
pub enum PeerLinkError {
    #[error("Missing required permissions: {}", .missing.join(", "))]
    PermissionDenied { missing: Vec<String> },

    #[error("{operation} already active")]
    AlreadyActive { operation: &'static str },

    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },

    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Peer has not published a channel port")]
    PortUnknown,

    #[error("Peer connection closed")]
    ConnectionClosed,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },
}

impl PeerLinkError {
    pub fn permission_denied(missing: Vec<String>) -> Self {
        Self::PermissionDenied { missing }
    }

    pub fn already_active(operation: &'static str) -> Self {
        Self::AlreadyActive { operation }
    }

    pub fn peer_not_found(peer: impl Into<String>) -> Self {
        Self::PeerNotFound { peer: peer.into() }
    }

    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

/// Errors reported by a radio backend when a request cannot be issued
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Radio unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected with status {0}")]
    Status(GattStatus),

    #[error("Unknown remote device: {0}")]
    UnknownDevice(String),

    #[error("Radio I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from a single data channel
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for peerlink operations
pub type Result<T> = std::result::Result<T, PeerLinkError>;
