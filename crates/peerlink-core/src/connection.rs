//! Peer connection driver
//!
//! Each [`PeerConnection`] runs one driver task. Hardware callbacks, owner
//! requests and channel notifications all enter through the same queue, so
//! they are applied to the [`Handshake`] one at a time and in arrival order no
//! matter which context produced them. Hardware requests leave through the
//! shared [`TaskThrottle`].

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelHandler, DataChannel};
use crate::config::PeerLinkConfig;
use crate::error::{PeerLinkError, Result};
use crate::handshake::{FailureReason, Handshake, HandshakeAction, HandshakeEvent};
use crate::peer::{HardwareAddress, Peer};
use crate::radio::{
    BoxedStream, CentralRadio, GattEvent, GattEventSink, GattLink, ScanRecord,
};
use crate::throttle::{TaskThrottle, TaskTicket};

pub use crate::handshake::ConnectionState;

/// Identifier of one peer connection within a process
pub type ConnectionId = u64;

/// Lifecycle notifications sent to the connection's owner
#[derive(Debug, Clone)]
pub enum ConnectionNotice {
    /// Handshake complete, identity known
    Found(Arc<PeerConnection>),
    /// Data channel open
    ChannelReady(Arc<PeerConnection>),
    /// Connection ended; sent exactly once
    Lost {
        connection: Arc<PeerConnection>,
        state: ConnectionState,
    },
}

pub(crate) enum ConnectionInput {
    Connect,
    Gatt(GattEvent),
    OpenChannel {
        handler: Arc<dyn ChannelHandler>,
        reply: oneshot::Sender<Result<()>>,
    },
    ChannelClosed,
    RequestFailed(String),
    Close(ConnectionState),
}

// ----------------------------------------------------------------------------
// Peer Connection
// ----------------------------------------------------------------------------

/// One tracked remote device
pub struct PeerConnection {
    id: ConnectionId,
    record: ScanRecord,
    handshake: Mutex<Handshake>,
    state: watch::Sender<ConnectionState>,
    inputs: mpsc::UnboundedSender<ConnectionInput>,
    channel: Mutex<Option<Arc<DataChannel>>>,
}

impl PeerConnection {
    /// Create a connection for a scan result and start its driver
    ///
    /// Nothing is sent to the radio until [`PeerConnection::connect`].
    pub fn spawn(
        id: ConnectionId,
        record: ScanRecord,
        radio: Arc<dyn CentralRadio>,
        throttle: TaskThrottle,
        notices: mpsc::UnboundedSender<ConnectionNotice>,
        config: &PeerLinkConfig,
    ) -> Arc<Self> {
        let (inputs, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Discovered);
        let handshake = Handshake::new(
            record.address,
            config.max_connect_retries,
            config.retryable_status,
        );

        let connection = Arc::new(Self {
            id,
            record,
            handshake: Mutex::new(handshake),
            state,
            inputs,
            channel: Mutex::new(None),
        });

        let driver = Driver {
            connection: connection.clone(),
            radio,
            throttle,
            notices,
            read_buffer_size: config.read_buffer_size,
            link: None,
            ticket: None,
            pending_open: None,
            opened_stream: None,
        };
        tokio::spawn(driver.run(rx));

        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> HardwareAddress {
        self.record.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes; each value is published after its actions ran
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> Option<String> {
        self.handshake().identity().map(str::to_string)
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.handshake().failure().cloned()
    }

    /// Snapshot of everything learned about the peer so far
    pub fn peer(&self) -> Peer {
        let handshake = self.handshake();
        Peer {
            id: handshake.identity().map(str::to_string),
            address: self.record.address,
            name: self.record.name.clone(),
            rssi: self.record.rssi,
            port: handshake.port(),
            metadata: handshake.metadata().map(<[u8]>::to_vec),
        }
    }

    /// Start the handshake
    pub fn connect(&self) {
        self.submit(ConnectionInput::Connect);
    }

    /// Open a data channel to the published port
    ///
    /// Resolves once the channel is open. `handler` receives its data and
    /// its close notification.
    pub async fn open_channel(&self, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .inputs
            .send(ConnectionInput::OpenChannel { handler, reply })
            .is_err()
        {
            return Err(PeerLinkError::ConnectionClosed);
        }
        rx.await.unwrap_or(Err(PeerLinkError::ConnectionClosed))
    }

    /// Write to the open data channel
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let channel = self.channel_slot().clone();
        match channel {
            Some(channel) => Ok(channel.send(data).await?),
            None => Err(PeerLinkError::invalid_state("send", self.state())),
        }
    }

    /// Ask the driver to close without waiting
    pub fn request_close(&self, state: ConnectionState) {
        self.submit(ConnectionInput::Close(state));
    }

    /// Close and wait until every resource has been released
    ///
    /// Closing an already closed connection returns immediately.
    pub async fn close(&self, state: ConnectionState) -> ConnectionState {
        self.request_close(state);
        self.closed().await
    }

    /// Wait for a terminal state
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        result.unwrap_or(ConnectionState::Disconnected)
    }

    fn submit(&self, input: ConnectionInput) {
        if self.inputs.send(input).is_err() {
            debug!("{}: connection already finished", self.record.address);
        }
    }

    fn handshake(&self) -> MutexGuard<'_, Handshake> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel_slot(&self) -> MutexGuard<'_, Option<Arc<DataChannel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("address", &self.record.address)
            .field("state", &self.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

struct Driver {
    connection: Arc<PeerConnection>,
    radio: Arc<dyn CentralRadio>,
    throttle: TaskThrottle,
    notices: mpsc::UnboundedSender<ConnectionNotice>,
    read_buffer_size: usize,
    link: Option<Arc<dyn GattLink>>,
    ticket: Option<TaskTicket>,
    pending_open: Option<(Arc<dyn ChannelHandler>, oneshot::Sender<Result<()>>)>,
    opened_stream: Option<BoxedStream>,
}

impl Driver {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<ConnectionInput>) {
        let address = self.connection.address();
        debug!("{}: connection {} started", address, self.connection.id);

        while let Some(input) = inputs.recv().await {
            let actions = self.handle(input);
            for action in actions {
                self.execute(action).await;
            }
            self.discard_unclaimed_stream().await;

            let state = self.connection.handshake().state();
            self.connection.state.send_replace(state);
            if state.is_terminal() {
                break;
            }
        }

        debug!("{}: connection {} finished", address, self.connection.id);
    }

    fn handle(&mut self, input: ConnectionInput) -> Vec<HandshakeAction> {
        let event = match input {
            ConnectionInput::Connect => HandshakeEvent::Connect,
            ConnectionInput::Gatt(event) => {
                self.release_ticket();
                self.translate(event)
            }
            ConnectionInput::RequestFailed(reason) => {
                self.release_ticket();
                HandshakeEvent::RequestFailed(reason)
            }
            ConnectionInput::ChannelClosed => HandshakeEvent::ChannelClosed,
            ConnectionInput::Close(state) => HandshakeEvent::Close(state),
            ConnectionInput::OpenChannel { handler, reply } => {
                let requested = self.connection.handshake().open_channel();
                return match requested {
                    Ok(actions) => {
                        self.pending_open = Some((handler, reply));
                        actions
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Vec::new()
                    }
                };
            }
        };
        self.connection.handshake().apply(event)
    }

    fn translate(&mut self, event: GattEvent) -> HandshakeEvent {
        match event {
            GattEvent::ConnectionStateChanged { status, state } => {
                HandshakeEvent::LinkStateChanged { status, state }
            }
            GattEvent::ServicesDiscovered { status, services } => {
                HandshakeEvent::ServicesDiscovered { status, services }
            }
            GattEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            } => HandshakeEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            },
            GattEvent::ChannelOpened { result: Ok(stream) } => {
                self.opened_stream = Some(stream);
                HandshakeEvent::ChannelOpened
            }
            GattEvent::ChannelOpened { result: Err(e) } => {
                HandshakeEvent::ChannelOpenFailed(e.to_string())
            }
        }
    }

    async fn execute(&mut self, action: HandshakeAction) {
        let address = self.connection.address();
        match action {
            HandshakeAction::Connect => {
                if let Some(stale) = self.link.take() {
                    debug!("{}: releasing link before reconnecting", address);
                    stale.close();
                }
                let sink = GattEventSink::new(self.connection.inputs.clone());
                match self.radio.open_link(address, sink) {
                    Ok(link) => {
                        self.link = Some(link);
                        self.issue("connect", |link| link.connect());
                    }
                    Err(e) => self.request_failed(format!("open link: {}", e)),
                }
            }
            HandshakeAction::DiscoverServices => {
                self.issue("discover services", |link| link.discover_services())
            }
            HandshakeAction::ReadCharacteristic {
                service,
                characteristic,
            } => self.issue("read characteristic", move |link| {
                link.read_characteristic(service, characteristic)
            }),
            HandshakeAction::OpenChannel { psm } => {
                debug!("{}: opening channel on psm {}", address, psm);
                self.issue("open channel", move |link| link.open_channel(psm))
            }
            HandshakeAction::AttachChannel => self.attach_channel(),
            HandshakeAction::NotifyFound => {
                info!("{}: peer {} found", address, self.connection.peer());
                self.notify(ConnectionNotice::Found(self.connection.clone()));
            }
            HandshakeAction::NotifyChannelReady => {
                info!("{}: channel ready", address);
                self.notify(ConnectionNotice::ChannelReady(self.connection.clone()));
            }
            HandshakeAction::Close { state } => self.teardown(state).await,
        }
    }

    /// Queue a request on the throttle; failure to issue comes back as an input
    fn issue<F>(&mut self, what: &'static str, request: F)
    where
        F: FnOnce(&dyn GattLink) -> std::result::Result<(), crate::error::RadioError>
            + Send
            + 'static,
    {
        let Some(link) = self.link.clone() else {
            self.request_failed(format!("{}: no link", what));
            return;
        };
        let inputs = self.connection.inputs.clone();
        let address = self.connection.address();

        debug!("{}: {}", address, what);
        self.ticket = Some(self.throttle.submit(move || {
            if let Err(e) = request(link.as_ref()) {
                warn!("{}: {} request failed: {}", address, what, e);
                let _ = inputs.send(ConnectionInput::RequestFailed(format!("{}: {}", what, e)));
            }
        }));
    }

    fn attach_channel(&mut self) {
        let address = self.connection.address();
        let (Some(stream), Some((handler, reply))) =
            (self.opened_stream.take(), self.pending_open.take())
        else {
            self.request_failed("channel opened without a pending request".to_string());
            return;
        };

        let handler = Arc::new(PeerChannelHandler {
            inner: handler,
            inputs: self.connection.inputs.clone(),
        });
        let channel = DataChannel::open(stream, address, handler, self.read_buffer_size);
        *self.connection.channel_slot() = Some(channel);
        let _ = reply.send(Ok(()));
    }

    async fn teardown(&mut self, state: ConnectionState) {
        let address = self.connection.address();
        if let Some(ticket) = self.ticket.take() {
            ticket.cancel();
        }

        if let Some((_, reply)) = self.pending_open.take() {
            let _ = reply.send(Err(PeerLinkError::ConnectionClosed));
        }
        self.discard_unclaimed_stream().await;

        let channel = self.connection.channel_slot().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close(None).await {
                error!("{}: error closing channel: {}", address, e);
            }
        }
        if let Some(link) = self.link.take() {
            link.close();
        }

        info!("{}: connection closed as {}", address, state);
        self.notify(ConnectionNotice::Lost {
            connection: self.connection.clone(),
            state,
        });
    }

    async fn discard_unclaimed_stream(&mut self) {
        if let Some(mut stream) = self.opened_stream.take() {
            debug!("{}: discarding unclaimed stream", self.connection.address());
            let _ = stream.shutdown().await;
        }
    }

    fn release_ticket(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.complete();
        }
    }

    fn request_failed(&self, reason: String) {
        let _ = self
            .connection
            .inputs
            .send(ConnectionInput::RequestFailed(reason));
    }

    fn notify(&self, notice: ConnectionNotice) {
        if self.notices.send(notice).is_err() {
            debug!("{}: owner stopped listening", self.connection.address());
        }
    }
}

/// Forwards channel callbacks to the application handler and closes the
/// connection when the channel ends
struct PeerChannelHandler {
    inner: Arc<dyn ChannelHandler>,
    inputs: mpsc::UnboundedSender<ConnectionInput>,
}

#[async_trait]
impl ChannelHandler for PeerChannelHandler {
    async fn on_data(&self, channel: &Arc<DataChannel>, data: Vec<u8>) {
        self.inner.on_data(channel, data).await;
    }

    fn on_closed(&self, channel: &DataChannel, error: Option<&io::Error>) {
        self.inner.on_closed(channel, error);
        let _ = self.inputs.send(ConnectionInput::ChannelClosed);
    }
}
