//! Two nodes sharing one air find and talk to each other


use std::sync::Arc;
use std::time::Duration;

use peerlink_core::radio::memory::MemoryAir;
use peerlink_core::{AllowAll, ForwardHandler, HardwareAddress, PeerEvent, PeerLinkNode};
use test_utils::{config, next_event};

fn node(air: &MemoryAir, address: HardwareAddress, identity: &str) -> PeerLinkNode {
    PeerLinkNode::new(
        Arc::new(air.central(address)),
        Arc::new(air.peripheral(address, Some(identity))),
        config(identity),
        Arc::new(AllowAll),
    )
    .expect("node should build")
}

#[tokio::test]
async fn nodes_exchange_messages() {
    let air = MemoryAir::new();
    let alice_address = HardwareAddress::new([0x0E, 0, 0, 0, 0, 0x01]);
    let bob_address = HardwareAddress::new([0x0E, 0, 0, 0, 0, 0x02]);

    let alice = node(&air, alice_address, "alice");
    let (forward, mut inbound) = ForwardHandler::channel();
    let bob = node(&air, bob_address, "bob").with_inbound_handler(Arc::new(forward));

    alice.start_publishing().await.expect("alice should publish");
    bob.start_publishing().await.expect("bob should publish");

    let mut events = alice.start_browsing().expect("alice should browse");
    let peer = match next_event(&mut events).await {
        PeerEvent::Found(peer) => peer,
        other => panic!("expected a found event, got {}", other),
    };
    assert_eq!(peer.id.as_deref(), Some("bob"));
    assert_eq!(peer.address, bob_address);

    let _messages = alice.connect(&peer).await.expect("connect should succeed");
    alice.send(&peer, "hi bob").await.expect("send should succeed");

    let message = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("message should arrive")
        .expect("handler should stay alive");
    assert_eq!(message.remote, alice_address);
    assert_eq!(message.data, b"hi bob".to_vec());

    alice.shutdown().await;
    bob.shutdown().await;
    assert!(!alice.discovery().is_scanning());
    assert!(!bob.server().is_running());
    assert!(!air.is_advertising(bob_address));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let air = MemoryAir::new();
    let address = HardwareAddress::new([0x0E, 0, 0, 0, 0, 0x03]);
    let result = PeerLinkNode::new(
        Arc::new(air.central(address)),
        Arc::new(air.peripheral(address, None)),
        config(""),
        Arc::new(AllowAll),
    );
    assert!(result.is_err());
}
