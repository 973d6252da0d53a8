//! Peer records and the visibility events handed to applications

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PeerLinkError;

// ----------------------------------------------------------------------------
// Hardware Address
// ----------------------------------------------------------------------------

/// Transport-level device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for HardwareAddress {
    type Err = PeerLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PeerLinkError::configuration(format!("invalid hardware address: {}", s));

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 || parts.iter().any(|part| part.len() != 2) {
            return Err(invalid());
        }

        let bytes = hex::decode(parts.concat()).map_err(|_| invalid())?;
        let octets: [u8; 6] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(octets))
    }
}

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

/// A remote participant as seen by the application
///
/// `id` is learned during the handshake. Until then the hardware address is
/// the only valid key, so equality and hashing follow [`Peer::key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Application-level identity
    pub id: Option<String>,
    /// Transport-level address
    pub address: HardwareAddress,
    /// Advertised device name
    pub name: Option<String>,
    /// Signal strength of the scan result that found this peer
    pub rssi: Option<i16>,
    /// Data channel PSM learned during the handshake
    pub port: Option<u16>,
    /// Opaque metadata learned during the handshake
    pub metadata: Option<Vec<u8>>,
}

/// Identity key for a [`Peer`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Identity(String),
    Address(HardwareAddress),
}

impl Peer {
    /// Create a peer known only by its address
    pub fn new(address: HardwareAddress) -> Self {
        Self {
            id: None,
            address,
            name: None,
            rssi: None,
            port: None,
            metadata: None,
        }
    }

    pub fn key(&self) -> PeerKey {
        match &self.id {
            Some(id) => PeerKey::Identity(id.clone()),
            None => PeerKey::Address(self.address),
        }
    }

    /// Short human-readable label, preferring the identity
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => self.address.to_string(),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) @{}",
            self.name.as_deref().unwrap_or("?"),
            self.id.as_deref().unwrap_or("?"),
            self.address
        )?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Peer Events
// ----------------------------------------------------------------------------

/// One visibility change for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "peer", rename_all = "snake_case")]
pub enum PeerEvent {
    /// Handshake completed and the identity is known
    Found(Peer),
    /// A data channel to the peer is open
    Connected(Peer),
    /// The peer connection ended
    Lost(Peer),
}

impl PeerEvent {
    pub fn peer(&self) -> &Peer {
        match self {
            PeerEvent::Found(peer) | PeerEvent::Connected(peer) | PeerEvent::Lost(peer) => peer,
        }
    }

    pub fn into_peer(self) -> Peer {
        match self {
            PeerEvent::Found(peer) | PeerEvent::Connected(peer) | PeerEvent::Lost(peer) => peer,
        }
    }
}

impl fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Found(peer) => write!(f, "+{}", peer),
            PeerEvent::Connected(peer) => write!(f, "*{}", peer),
            PeerEvent::Lost(peer) => write!(f, "-{}", peer),
        }
    }
}
