//! Peer discovery and data channels over a GATT-style radio
//!
//! Devices advertise a namespace service. A browsing device connects to every
//! advertiser it sees, reads its identity, port and metadata characteristics,
//! and can then open a byte-stream channel to the published port.
//!
//! ## Architecture
//!
//! - [`throttle`] - single-worker queue that serializes hardware requests
//! - [`channel`] - one byte-stream connection with a read loop and idempotent close
//! - [`handshake`] - the per-peer transition function
//! - [`connection`] - the task that drives one peer through the handshake
//! - [`discovery`] - scanning, deduplication and peer events
//! - [`server`] - advertising, the published profile and inbound channels
//! - [`radio`] - the hardware seam and an in-memory implementation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use peerlink_core::radio::memory::MemoryAir;
//! use peerlink_core::{AllowAll, HardwareAddress, PeerEvent, PeerLinkConfig, PeerLinkNode};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let air = MemoryAir::new();
//! let address = HardwareAddress::new([0x02, 0, 0, 0, 0, 0x01]);
//! let node = PeerLinkNode::new(
//!     Arc::new(air.central(address)),
//!     Arc::new(air.peripheral(address, Some("demo"))),
//!     PeerLinkConfig::new().with_local_identity("peer-1"),
//!     Arc::new(AllowAll),
//! )?;
//!
//! node.start_publishing().await?;
//! let mut events = node.start_browsing()?;
//! while let Some(event) = events.next().await {
//!     if let PeerEvent::Found(peer) = event {
//!         let mut messages = node.connect(&peer).await?;
//!         node.send(&peer, "hello").await?;
//!         println!("{:?}", messages.next().await);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod node;
pub mod peer;
pub mod permissions;
pub mod protocol;
pub mod radio;
pub mod server;
pub mod throttle;

// Public API exports
pub use channel::{ChannelHandler, ChannelId, DataChannel};
pub use config::PeerLinkConfig;
pub use connection::{ConnectionId, ConnectionNotice, ConnectionState, PeerConnection};
pub use discovery::{DiscoveryService, MessageStream, PeerEventStream};
pub use error::{ChannelError, PeerLinkError, RadioError, Result};
pub use handshake::FailureReason;
pub use node::PeerLinkNode;
pub use peer::{HardwareAddress, Peer, PeerEvent};
pub use permissions::{AllowAll, PermissionChecker, StaticPermissions};
pub use radio::GattStatus;
pub use server::{EchoHandler, ForwardHandler, InboundHandler, InboundMessage, LocalServer};
pub use throttle::{TaskThrottle, TaskTicket};
