//! Discovery service tests
//!
//! A browsing central at [`CENTRAL`] scans a shared in-memory air populated
//! by local servers or by hand-injected scan results.


use std::sync::Arc;
use std::time::Duration;

use peerlink_core::permissions::SCAN;
use peerlink_core::radio::memory::{LinkRequest, MemoryAir};
use peerlink_core::{
    AllowAll, ConnectionState, DiscoveryService, Peer, PeerEvent, PeerLinkError,
    PermissionChecker, StaticPermissions,
};
use test_utils::{
    address, config, eventually, expect_quiet, next_event, publish, scan_record, CENTRAL,
};

fn discovery_with(air: &MemoryAir, permissions: Arc<dyn PermissionChecker>) -> DiscoveryService {
    DiscoveryService::new(Arc::new(air.central(CENTRAL)), config("browser"), permissions)
}

fn discovery(air: &MemoryAir) -> DiscoveryService {
    discovery_with(air, Arc::new(AllowAll))
}

async fn found(events: &mut peerlink_core::PeerEventStream) -> Peer {
    match next_event(events).await {
        PeerEvent::Found(peer) => peer,
        other => panic!("expected a found event, got {}", other),
    }
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

#[tokio::test]
async fn repeated_scan_results_connect_once() {
    let air = MemoryAir::new();
    let remote = address(1);
    let discovery = discovery(&air);

    let _events = discovery.start_scanning().expect("scan should start");
    eventually("scan to reach the radio", || air.is_scanning(CENTRAL)).await;

    air.inject_scan(scan_record(remote));
    air.inject_scan(scan_record(remote));
    air.inject_scan(scan_record(remote));

    eventually("connect request", || {
        air.links_to(remote)
            .first()
            .map_or(false, |link| link.count(&LinkRequest::Connect) == 1)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(air.links_to(remote).len(), 1);
}

#[tokio::test]
async fn advertising_peer_is_found() {
    let air = MemoryAir::new();
    let remote = address(2);
    let server = publish(&air, remote, "alpha").await;
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    let peer = found(&mut events).await;

    assert_eq!(peer.id.as_deref(), Some("alpha"));
    assert_eq!(peer.address, remote);
    assert_eq!(peer.name.as_deref(), Some("alpha"));
    assert_eq!(peer.port, server.psm());
    assert_eq!(peer.metadata, Some(Vec::new()));
    assert_eq!(discovery.peers(), vec![peer]);
}

#[tokio::test]
async fn peer_advertising_after_scan_start_is_found() {
    let air = MemoryAir::new();
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    eventually("scan to reach the radio", || air.is_scanning(CENTRAL)).await;

    let _server = publish(&air, address(3), "late").await;
    assert_eq!(found(&mut events).await.id.as_deref(), Some("late"));
}

#[tokio::test]
async fn same_identity_on_two_addresses_is_reported_once() {
    let air = MemoryAir::new();
    let first = address(4);
    let second = address(5);
    let _a = publish(&air, first, "twin").await;
    let _b = publish(&air, second, "twin").await;
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    let peer = found(&mut events).await;
    assert_eq!(peer.id.as_deref(), Some("twin"));

    let duplicate = if peer.address == first { second } else { first };
    eventually("duplicate link to close", || {
        air.links_to(duplicate)
            .first()
            .map_or(false, |link| link.is_closed())
    })
    .await;

    expect_quiet(&mut events, Duration::from_millis(200)).await;
    assert_eq!(discovery.peers().len(), 1);

    // The retired address is not connected again while scanning
    air.inject_scan(scan_record(duplicate));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(air.links_to(duplicate).len(), 1);
}

#[tokio::test]
async fn scan_failure_ends_the_event_stream() {
    let air = MemoryAir::new();
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    eventually("scan to reach the radio", || air.is_scanning(CENTRAL)).await;

    air.fail_scans("adapter powered off");
    let ended = tokio::time::timeout(Duration::from_secs(5), events.next_event())
        .await
        .expect("stream should end");
    assert!(ended.is_none());
    assert!(!discovery.is_scanning());
}

#[tokio::test]
async fn start_while_scanning_is_rejected() {
    let air = MemoryAir::new();
    let discovery = discovery(&air);

    let events = discovery.start_scanning().expect("scan should start");
    assert!(matches!(
        discovery.start_scanning(),
        Err(PeerLinkError::AlreadyActive { .. })
    ));

    drop(events);
    assert!(!discovery.is_scanning());
    eventually("scan to stop", || !air.is_scanning(CENTRAL)).await;

    let _events = discovery.start_scanning().expect("scan should restart");
    assert!(discovery.is_scanning());
}

#[tokio::test]
async fn stop_scanning_when_idle_is_a_noop() {
    let air = MemoryAir::new();
    let discovery = discovery(&air);

    discovery.stop_scanning();
    assert!(!discovery.is_scanning());
}

#[tokio::test]
async fn missing_permission_fails_before_scanning() {
    let air = MemoryAir::new();
    let discovery = discovery_with(&air, Arc::new(StaticPermissions::new([SCAN])));

    match discovery.start_scanning() {
        Err(PeerLinkError::PermissionDenied { missing }) => {
            assert_eq!(missing, vec!["bluetooth.connect".to_string()])
        }
        Err(other) => panic!("expected a permission error, got {}", other),
        Ok(_) => panic!("scan should not start"),
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!air.is_scanning(CENTRAL));
    assert!(!discovery.is_scanning());
}

// ----------------------------------------------------------------------------
// Messaging
// ----------------------------------------------------------------------------

#[tokio::test]
async fn messages_round_trip_through_echo_server() {
    let air = MemoryAir::new();
    let remote = address(6);
    let server = publish(&air, remote, "echo").await;
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    let peer = found(&mut events).await;

    let mut messages = discovery.connect(&peer).await.expect("connect should succeed");
    assert_eq!(messages.peer(), peer);
    match next_event(&mut events).await {
        PeerEvent::Connected(connected) => assert_eq!(connected, peer),
        other => panic!("expected a connected event, got {}", other),
    }
    eventually("server to accept", || server.connection_count() == 1).await;

    discovery.send(&peer, "hello").await.expect("send should succeed");
    let reply = tokio::time::timeout(Duration::from_secs(5), messages.next_message())
        .await
        .expect("echo should arrive");
    assert_eq!(reply.as_deref(), Some("hello"));

    assert_eq!(messages.close().await, ConnectionState::Disconnected);
    match next_event(&mut events).await {
        PeerEvent::Lost(lost) => assert_eq!(lost, peer),
        other => panic!("expected a lost event, got {}", other),
    }
    assert!(discovery.peers().is_empty());
    eventually("server to drop the channel", || server.connection_count() == 0).await;
}

#[tokio::test]
async fn dropping_message_stream_closes_the_connection() {
    let air = MemoryAir::new();
    let remote = address(7);
    let _server = publish(&air, remote, "dropper").await;
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    let peer = found(&mut events).await;

    let messages = discovery.connect(&peer).await.expect("connect should succeed");
    assert!(matches!(next_event(&mut events).await, PeerEvent::Connected(_)));

    drop(messages);
    match next_event(&mut events).await {
        PeerEvent::Lost(lost) => assert_eq!(lost.id.as_deref(), Some("dropper")),
        other => panic!("expected a lost event, got {}", other),
    }
    let link = air.links_to(remote)[0].clone();
    eventually("link to close", || link.is_closed()).await;
}

#[tokio::test]
async fn send_to_untracked_peer_is_ignored() {
    let air = MemoryAir::new();
    let discovery = discovery(&air);

    let stranger = Peer::new(address(8));
    assert!(discovery.send(&stranger, "anyone there?").await.is_ok());
}

#[tokio::test]
async fn connect_to_unknown_peer_fails() {
    let air = MemoryAir::new();
    let discovery = discovery(&air);

    let mut stranger = Peer::new(address(9));
    stranger.id = Some("nobody".to_string());
    assert!(matches!(
        discovery.connect(&stranger).await,
        Err(PeerLinkError::PeerNotFound { .. })
    ));
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let air = MemoryAir::new();
    let _a = publish(&air, address(10), "one").await;
    let _b = publish(&air, address(11), "two").await;
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    found(&mut events).await;
    found(&mut events).await;

    discovery.shutdown().await;
    assert!(!discovery.is_scanning());
    for remote in [address(10), address(11)] {
        assert!(air.links_to(remote).iter().all(|link| link.is_closed()));
    }
    eventually("scan to stop", || !air.is_scanning(CENTRAL)).await;
}

#[tokio::test]
async fn stopped_scan_keeps_connections_tracked() {
    let air = MemoryAir::new();
    let _alpha = publish(&air, address(12), "alpha").await;
    let discovery = discovery(&air);

    let mut events = discovery.start_scanning().expect("scan should start");
    let peer = found(&mut events).await;

    discovery.stop_scanning();
    let ended = tokio::time::timeout(Duration::from_secs(5), events.next_event())
        .await
        .expect("stream should end");
    assert!(ended.is_none());
    assert_eq!(discovery.peers(), vec![peer.clone()]);
    let links = air.links_to(address(12));
    assert_eq!(links.len(), 1);
    assert!(!links[0].is_closed());
    eventually("scan to stop", || !air.is_scanning(CENTRAL)).await;

    // The address is still tracked, so a new session neither reconnects nor reports it
    let mut events = discovery.start_scanning().expect("scan should restart");
    eventually("scan to restart", || air.is_scanning(CENTRAL)).await;
    expect_quiet(&mut events, Duration::from_millis(300)).await;
    assert_eq!(air.links_to(address(12)).len(), 1);
    assert_eq!(discovery.peers(), vec![peer]);

    discovery.shutdown().await;
    assert!(air.links_to(address(12))[0].is_closed());
    eventually("peer to be forgotten", || discovery.peers().is_empty()).await;
}
