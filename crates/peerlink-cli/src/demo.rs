//! In-process demo session
//!
//! Publishes a number of echoing peers on a [`MemoryAir`], browses for them
//! from a local discovery service, and exchanges messages with each one as
//! soon as it is found.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use peerlink_core::radio::memory::MemoryAir;
use peerlink_core::{
    AllowAll, DiscoveryService, HardwareAddress, LocalServer, PeerEvent, PeerLinkConfig,
};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

const LOCAL_ADDRESS: HardwareAddress = HardwareAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// One message sent to a peer and what came back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub peer: String,
    pub sent: String,
    pub received: Option<String>,
}

impl Exchange {
    pub fn echoed(&self) -> bool {
        self.received.as_deref() == Some(self.sent.as_str())
    }
}

/// Everything observed during one demo session
#[derive(Debug, Clone, Default, Serialize)]
pub struct DemoReport {
    pub local_identity: String,
    pub events: Vec<PeerEvent>,
    pub exchanges: Vec<Exchange>,
}

impl DemoReport {
    pub fn found(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, PeerEvent::Found(_)))
            .count()
    }

    pub fn echoed(&self) -> usize {
        self.exchanges.iter().filter(|e| e.echoed()).count()
    }
}

fn peer_address(index: usize) -> HardwareAddress {
    HardwareAddress::new([0x0A, 0x00, 0x00, 0x00, 0x00, (index + 1) as u8])
}

fn peer_config(base: &PeerLinkConfig, identity: &str) -> PeerLinkConfig {
    let mut config = base
        .clone()
        .with_local_identity(identity)
        .with_metadata(Vec::new());
    config.local_name = None;
    config
}

/// Run one session: publish, browse, exchange messages and tear down
pub async fn run(config: &AppConfig) -> Result<DemoReport> {
    config.validate()?;
    let link_config = config.to_link_config()?;
    let air = MemoryAir::new();

    let mut servers = Vec::with_capacity(config.demo.peers);
    for index in 0..config.demo.peers {
        let address = peer_address(index);
        let identity = format!("peer-{}", index + 1);
        let server = LocalServer::new(
            Arc::new(air.peripheral(address, Some(&identity))),
            peer_config(&link_config, &identity),
            Arc::new(AllowAll),
        );
        let psm = server.start().await?;
        info!("Published {} at {} on psm {}", identity, address, psm);
        servers.push(server);
    }

    let discovery = DiscoveryService::new(
        Arc::new(air.central(LOCAL_ADDRESS)),
        link_config.clone(),
        Arc::new(AllowAll),
    );
    let mut report = DemoReport {
        local_identity: link_config.local_identity.clone(),
        ..DemoReport::default()
    };

    let session = tokio::time::timeout(
        config.demo.session_timeout(),
        browse(&discovery, config, &mut report),
    )
    .await;

    discovery.shutdown().await;
    for server in &servers {
        if let Err(e) = server.stop().await {
            warn!("Failed to stop {}: {}", server.identity(), e);
        }
    }

    match session {
        Ok(result) => result?,
        Err(_) => {
            return Err(CliError::Demo(format!(
                "session did not finish within {} ms",
                config.demo.session_timeout_ms
            )))
        }
    }

    info!(
        "Demo finished: {} peers found, {}/{} messages echoed",
        report.found(),
        report.echoed(),
        report.exchanges.len()
    );
    Ok(report)
}

/// Talk to every peer once and wait until each connection has ended
async fn browse(
    discovery: &DiscoveryService,
    config: &AppConfig,
    report: &mut DemoReport,
) -> Result<()> {
    let mut events = discovery.start_scanning()?;
    let mut lost = 0;

    while lost < config.demo.peers {
        let Some(event) = events.next().await else {
            return Err(CliError::Demo("scanning stopped early".to_string()));
        };
        debug!("Event {}", event);
        report.events.push(event.clone());

        match event {
            PeerEvent::Found(peer) => {
                let mut messages = discovery.connect(&peer).await?;
                for message in &config.demo.messages {
                    discovery.send(&peer, message).await?;
                    let received =
                        tokio::time::timeout(config.demo.reply_timeout(), messages.next())
                            .await
                            .ok()
                            .flatten();
                    if received.is_none() {
                        warn!("No reply from {} to {:?}", peer.label(), message);
                    }
                    report.exchanges.push(Exchange {
                        peer: peer.label(),
                        sent: message.clone(),
                        received,
                    });
                }
                messages.close().await;
            }
            PeerEvent::Lost(_) => lost += 1,
            PeerEvent::Connected(_) => {}
        }
    }
    Ok(())
}
