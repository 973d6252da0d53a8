//! Peer discovery
//!
//! Scans for the namespace service, runs one [`PeerConnection`] per newly
//! seen hardware address, and republishes their lifecycle as [`PeerEvent`]s.
//!
//! Connections live in one arena with two indices. The address index is
//! filled on the first scan result and keeps the address from being
//! connected twice. The identity index is filled when a handshake completes
//! and keeps one logical peer from being reported twice when it is reachable
//! through several addresses.
//!
//! Connections outlive the scan session that found them. Their notices go to
//! one service-wide router, so a Lost notice still reaches the registry after
//! scanning stops and a later session does not reconnect a tracked address.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelHandler, DataChannel};
use crate::config::PeerLinkConfig;
use crate::connection::{ConnectionId, ConnectionNotice, ConnectionState, PeerConnection};
use crate::error::{PeerLinkError, Result};
use crate::peer::{HardwareAddress, Peer, PeerEvent};
use crate::permissions::{self, PermissionChecker, CONNECT, DISCOVERY_CAPABILITIES};
use crate::protocol::SERVICE_UUID;
use crate::radio::{CentralRadio, ScanEvent, ScanRecord, ScanSink};
use crate::throttle::TaskThrottle;

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressEntry {
    Live(ConnectionId),
    /// Not connected again until the next scan session starts
    Retired,
}

#[derive(Default)]
struct PeerRegistry {
    connections: HashMap<ConnectionId, Arc<PeerConnection>>,
    by_address: HashMap<HardwareAddress, AddressEntry>,
    by_identity: HashMap<String, ConnectionId>,
}

impl PeerRegistry {
    fn is_tracked(&self, address: &HardwareAddress) -> bool {
        self.by_address.contains_key(address)
    }

    fn insert(&mut self, connection: Arc<PeerConnection>) {
        self.by_address
            .insert(connection.address(), AddressEntry::Live(connection.id()));
        self.connections.insert(connection.id(), connection);
    }

    /// Index a completed handshake; false if another live connection owns the identity
    fn claim_identity(&mut self, connection: &PeerConnection, identity: &str) -> bool {
        match self.by_identity.get(identity) {
            Some(&owner) if owner != connection.id() && self.connections.contains_key(&owner) => {
                self.by_address
                    .insert(connection.address(), AddressEntry::Retired);
                false
            }
            _ => {
                self.by_identity.insert(identity.to_string(), connection.id());
                true
            }
        }
    }

    fn owns_identity(&self, connection: &PeerConnection) -> bool {
        connection
            .identity()
            .and_then(|identity| self.by_identity.get(&identity).copied())
            == Some(connection.id())
    }

    /// Forget a finished connection; true if it owned its identity
    fn remove(&mut self, connection: &PeerConnection, state: ConnectionState) -> bool {
        self.connections.remove(&connection.id());

        let address = connection.address();
        if self.by_address.get(&address) == Some(&AddressEntry::Live(connection.id())) {
            if state == ConnectionState::Failed {
                self.by_address.insert(address, AddressEntry::Retired);
            } else {
                self.by_address.remove(&address);
            }
        }

        let owned = self.owns_identity(connection);
        if owned {
            if let Some(identity) = connection.identity() {
                self.by_identity.remove(&identity);
            }
        }
        owned
    }

    fn lookup(&self, peer: &Peer) -> Option<Arc<PeerConnection>> {
        let id = match &peer.id {
            Some(identity) => self.by_identity.get(identity).copied(),
            None => match self.by_address.get(&peer.address) {
                Some(AddressEntry::Live(id)) => Some(*id),
                _ => None,
            },
        }?;
        self.connections.get(&id).cloned()
    }

    fn identified(&self) -> Vec<Arc<PeerConnection>> {
        self.by_identity
            .values()
            .filter_map(|id| self.connections.get(id).cloned())
            .collect()
    }

    /// Drop retired addresses; live connections and their indices stay
    fn forget_retired(&mut self) {
        self.by_address
            .retain(|_, entry| matches!(entry, AddressEntry::Live(_)));
    }
}

// ----------------------------------------------------------------------------
// Discovery Service
// ----------------------------------------------------------------------------

struct ScanSession {
    id: u64,
    stop: oneshot::Sender<()>,
    /// Dropped with the session, which ends its event stream
    events: mpsc::UnboundedSender<PeerEvent>,
}

struct Shared {
    radio: Arc<dyn CentralRadio>,
    throttle: TaskThrottle,
    config: PeerLinkConfig,
    permissions: Arc<dyn PermissionChecker>,
    notices: mpsc::UnboundedSender<ConnectionNotice>,
    registry: Mutex<PeerRegistry>,
    session: Mutex<Option<ScanSession>>,
    next_session: AtomicU64,
    next_connection: AtomicU64,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, PeerRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> MutexGuard<'_, Option<ScanSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal the browse task of `session_id`, if it is still the active one
    fn stop_session(&self, session_id: Option<u64>) -> bool {
        let session = {
            let mut current = self.session();
            match current.as_ref() {
                Some(active) if session_id.map_or(true, |id| id == active.id) => current.take(),
                _ => None,
            }
        };
        match session {
            Some(session) => {
                let _ = session.stop.send(());
                true
            }
            None => false,
        }
    }

    /// Publish to the active session's stream, if any
    fn emit(&self, event: PeerEvent) {
        let events = self.session().as_ref().map(|session| session.events.clone());
        debug!("Peer event {}", event);
        match events {
            Some(events) => {
                if events.send(event).is_err() {
                    trace!("Peer event stream dropped");
                }
            }
            None => trace!("Not scanning, event not published"),
        }
    }
}

/// Scans for peers and tracks their connections
#[derive(Clone)]
pub struct DiscoveryService {
    shared: Arc<Shared>,
}

impl DiscoveryService {
    /// Create a discovery service with its own task throttle
    pub fn new(
        radio: Arc<dyn CentralRadio>,
        config: PeerLinkConfig,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        let throttle = TaskThrottle::new(config.task_timeout);
        Self::with_throttle(radio, config, permissions, throttle)
    }

    /// Create a discovery service sharing an existing throttle
    pub fn with_throttle(
        radio: Arc<dyn CentralRadio>,
        config: PeerLinkConfig,
        permissions: Arc<dyn PermissionChecker>,
        throttle: TaskThrottle,
    ) -> Self {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            radio,
            throttle,
            config,
            permissions,
            notices,
            registry: Mutex::new(PeerRegistry::default()),
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
        });

        let router = NoticeRouter {
            shared: Arc::downgrade(&shared),
        };
        tokio::spawn(router.run(notice_rx));

        Self { shared }
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.session().is_some()
    }

    /// Start scanning and return the peer event stream
    ///
    /// Dropping the stream stops scanning. Connections keep running after
    /// scanning stops and stay tracked until they close or [`shutdown`] runs.
    /// A new session does not report them again; see [`peers`].
    ///
    /// [`shutdown`]: DiscoveryService::shutdown
    /// [`peers`]: DiscoveryService::peers
    pub fn start_scanning(&self) -> Result<PeerEventStream> {
        permissions::require(self.shared.permissions.as_ref(), DISCOVERY_CAPABILITIES)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session_id = {
            let mut session = self.shared.session();
            if session.is_some() {
                warn!("Scan already active, ignoring start request");
                return Err(PeerLinkError::already_active("scan"));
            }
            let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
            *session = Some(ScanSession {
                id,
                stop: stop_tx,
                events: event_tx,
            });
            id
        };
        self.shared.registry().forget_retired();

        let (scan_tx, scan_rx) = mpsc::unbounded_channel();

        let radio = self.shared.radio.clone();
        let sink = ScanSink::new(scan_tx.clone());
        let failures = scan_tx;
        let ticket = self.shared.throttle.submit(move || {
            if let Err(e) = radio.start_scan(SERVICE_UUID, sink) {
                let _ = failures.send(ScanEvent::Failed {
                    reason: e.to_string(),
                });
            }
        });
        // No completion callback for scan start.
        ticket.complete();

        info!("Scanning for peers (session {})", session_id);
        let browser = Browser {
            shared: self.shared.clone(),
            session_id,
        };
        tokio::spawn(browser.run(scan_rx, stop_rx));

        Ok(PeerEventStream {
            events: event_rx,
            shared: Arc::downgrade(&self.shared),
            session_id,
        })
    }

    /// Stop the active scan; a no-op when not scanning
    pub fn stop_scanning(&self) {
        if !self.shared.stop_session(None) {
            debug!("Stop requested while not scanning");
        }
    }

    /// Open a data channel to a discovered peer
    ///
    /// Received bytes are decoded as lossy UTF-8. Dropping the returned
    /// stream closes the channel and the peer connection.
    pub async fn connect(&self, peer: &Peer) -> Result<MessageStream> {
        permissions::require(self.shared.permissions.as_ref(), &[CONNECT])?;

        let connection = self
            .shared
            .registry()
            .lookup(peer)
            .ok_or_else(|| PeerLinkError::peer_not_found(peer.label()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        connection
            .open_channel(Arc::new(MessageForwarder { messages: tx }))
            .await?;

        Ok(MessageStream {
            messages: rx,
            connection,
        })
    }

    /// Send a text message over the peer's open channel
    ///
    /// Untracked peers are logged and ignored.
    pub async fn send(&self, peer: &Peer, message: &str) -> Result<()> {
        let connection = self.shared.registry().lookup(peer);
        match connection {
            Some(connection) => connection.send(message.as_bytes()).await,
            None => {
                warn!("Dropping message for untracked peer {}", peer.label());
                Ok(())
            }
        }
    }

    /// Identified peers currently tracked
    pub fn peers(&self) -> Vec<Peer> {
        let connections = self.shared.registry().identified();
        connections.iter().map(|c| c.peer()).collect()
    }

    /// Stop scanning and close every tracked connection, including those
    /// found by earlier sessions
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<PeerConnection>> = self
            .shared
            .registry()
            .connections
            .values()
            .cloned()
            .collect();

        self.stop_scanning();
        for connection in connections {
            connection.close(ConnectionState::Disconnected).await;
        }
    }
}

// ----------------------------------------------------------------------------
// Browse Task
// ----------------------------------------------------------------------------

struct Browser {
    shared: Arc<Shared>,
    session_id: u64,
}

impl Browser {
    async fn run(
        self,
        mut scan_rx: mpsc::UnboundedReceiver<ScanEvent>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                event = scan_rx.recv() => match event {
                    Some(ScanEvent::Result(record)) => self.on_scan_result(record),
                    Some(ScanEvent::Failed { reason }) => {
                        warn!("Scan failed: {}", reason);
                        break;
                    }
                    None => break,
                },
            }
        }

        let radio = self.shared.radio.clone();
        let ticket = self.shared.throttle.submit(move || {
            if let Err(e) = radio.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        });
        ticket.complete();

        self.shared.stop_session(Some(self.session_id));
        info!("Scanning stopped (session {})", self.session_id);
    }

    fn on_scan_result(&self, record: ScanRecord) {
        let connection = {
            let mut registry = self.shared.registry();
            if registry.is_tracked(&record.address) {
                trace!("Already tracking {}", record.address);
                return;
            }

            debug!("Scan result from {}", record.address);
            let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
            let connection = PeerConnection::spawn(
                id,
                record,
                self.shared.radio.clone(),
                self.shared.throttle.clone(),
                self.shared.notices.clone(),
                &self.shared.config,
            );
            registry.insert(connection.clone());
            connection
        };
        connection.connect();
    }
}

// ----------------------------------------------------------------------------
// Notice Router
// ----------------------------------------------------------------------------

/// Applies connection notices to the registry for the life of the service
struct NoticeRouter {
    shared: Weak<Shared>,
}

impl NoticeRouter {
    async fn run(self, mut notices: mpsc::UnboundedReceiver<ConnectionNotice>) {
        while let Some(notice) = notices.recv().await {
            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            Self::on_notice(&shared, notice);
        }
        trace!("Notice router stopped");
    }

    fn on_notice(shared: &Shared, notice: ConnectionNotice) {
        match notice {
            ConnectionNotice::Found(connection) => {
                let Some(identity) = connection.identity() else {
                    warn!("{}: handshake finished without identity", connection.address());
                    return;
                };
                let claimed = shared.registry().claim_identity(&connection, &identity);
                if claimed {
                    shared.emit(PeerEvent::Found(connection.peer()));
                } else {
                    info!(
                        "{}: identity {} already reachable through another address",
                        connection.address(),
                        identity
                    );
                    connection.request_close(ConnectionState::Disconnected);
                }
            }
            ConnectionNotice::ChannelReady(connection) => {
                let owned = shared.registry().owns_identity(&connection);
                if owned {
                    shared.emit(PeerEvent::Connected(connection.peer()));
                }
            }
            ConnectionNotice::Lost { connection, state } => {
                let owned = shared.registry().remove(&connection, state);
                if owned {
                    shared.emit(PeerEvent::Lost(connection.peer()));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Streams
// ----------------------------------------------------------------------------

/// Peer visibility events for one scan session
///
/// Ends when scanning stops. Dropping it stops scanning.
pub struct PeerEventStream {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    shared: Weak<Shared>,
    session_id: u64,
}

impl PeerEventStream {
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }
}

impl Stream for PeerEventStream {
    type Item = PeerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for PeerEventStream {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop_session(Some(self.session_id));
        }
    }
}

/// Messages received over one peer's data channel
///
/// Ends when the channel closes. Dropping it closes the channel and the
/// peer connection.
pub struct MessageStream {
    messages: mpsc::UnboundedReceiver<String>,
    connection: Arc<PeerConnection>,
}

impl MessageStream {
    pub fn peer(&self) -> Peer {
        self.connection.peer()
    }

    pub async fn next_message(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    /// Close the channel and wait for the connection to finish
    pub async fn close(self) -> ConnectionState {
        self.connection.close(ConnectionState::Disconnected).await
    }
}

impl Stream for MessageStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.connection.request_close(ConnectionState::Disconnected);
    }
}

struct MessageForwarder {
    messages: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ChannelHandler for MessageForwarder {
    async fn on_data(&self, _channel: &Arc<DataChannel>, data: Vec<u8>) {
        let message = String::from_utf8_lossy(&data).into_owned();
        if self.messages.send(message).is_err() {
            trace!("Message stream dropped");
        }
    }

    fn on_closed(&self, channel: &DataChannel, error: Option<&io::Error>) {
        if let Some(e) = error {
            debug!("Message channel {} ended: {}", channel.id(), e);
        }
    }
}
