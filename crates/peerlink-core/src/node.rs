//! Discovery and publishing behind one handle

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PeerLinkConfig;
use crate::discovery::{DiscoveryService, MessageStream, PeerEventStream};
use crate::error::Result;
use crate::peer::Peer;
use crate::permissions::{PermissionChecker, DISCOVERY_CAPABILITIES, SERVER_CAPABILITIES};
use crate::radio::{CentralRadio, PeripheralRadio};
use crate::server::{InboundHandler, LocalServer};
use crate::throttle::TaskThrottle;

/// A device that both browses for peers and publishes itself
pub struct PeerLinkNode {
    config: PeerLinkConfig,
    discovery: DiscoveryService,
    server: LocalServer,
}

impl PeerLinkNode {
    pub fn new(
        central: Arc<dyn CentralRadio>,
        peripheral: Arc<dyn PeripheralRadio>,
        config: PeerLinkConfig,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Result<Self> {
        config.validate()?;

        let throttle = TaskThrottle::new(config.task_timeout);
        let discovery =
            DiscoveryService::with_throttle(central, config.clone(), permissions.clone(), throttle);
        let server = LocalServer::new(peripheral, config.clone(), permissions);

        Ok(Self {
            config,
            discovery,
            server,
        })
    }

    /// Route inbound server data to `handler`
    pub fn with_inbound_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.server = self.server.with_inbound_handler(handler);
        self
    }

    /// Every capability any operation of this node may need
    pub fn required_permissions() -> Vec<&'static str> {
        let mut capabilities: Vec<&'static str> = DISCOVERY_CAPABILITIES.to_vec();
        for capability in SERVER_CAPABILITIES {
            if !capabilities.contains(capability) {
                capabilities.push(capability);
            }
        }
        capabilities
    }

    pub fn identity(&self) -> &str {
        &self.config.local_identity
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub fn server(&self) -> &LocalServer {
        &self.server
    }

    pub fn start_browsing(&self) -> Result<PeerEventStream> {
        self.discovery.start_scanning()
    }

    pub fn stop_browsing(&self) {
        self.discovery.stop_scanning();
    }

    pub async fn start_publishing(&self) -> Result<u16> {
        self.server.start().await
    }

    pub async fn stop_publishing(&self) -> Result<()> {
        self.server.stop().await
    }

    pub async fn connect(&self, peer: &Peer) -> Result<MessageStream> {
        self.discovery.connect(peer).await
    }

    pub async fn send(&self, peer: &Peer, message: &str) -> Result<()> {
        self.discovery.send(peer, message).await
    }

    /// Stop browsing and publishing and close every connection
    pub async fn shutdown(&self) {
        self.discovery.shutdown().await;
        if let Err(e) = self.server.stop().await {
            warn!("Error stopping server: {}", e);
        }
        info!("Node {} shut down", self.config.local_identity);
    }
}
