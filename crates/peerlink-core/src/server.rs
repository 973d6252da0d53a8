//! Local server
//!
//! Publishes this device's identity and channel port through the namespace
//! GATT service, advertises the service, and accepts inbound data channels.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::channel::{ChannelHandler, ChannelId, DataChannel};
use crate::config::PeerLinkConfig;
use crate::error::{PeerLinkError, Result};
use crate::peer::HardwareAddress;
use crate::permissions::{self, PermissionChecker, SERVER_CAPABILITIES};
use crate::protocol::{
    encode_port, IDENTITY_CHARACTERISTIC_UUID, METADATA_CHARACTERISTIC_UUID,
    PORT_CHARACTERISTIC_UUID, REQUIRED_CHARACTERISTICS, SERVICE_UUID,
};
use crate::radio::{
    Advertisement, ChannelListener, CharacteristicReader, GattStatus, LocalService,
    PeripheralRadio, Registration,
};

// ----------------------------------------------------------------------------
// Inbound Routing
// ----------------------------------------------------------------------------

/// Receives bytes arriving on inbound channels
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_inbound(&self, channel: &Arc<DataChannel>, data: Vec<u8>);
}

/// Writes every chunk back to its sender
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl InboundHandler for EchoHandler {
    async fn on_inbound(&self, channel: &Arc<DataChannel>, data: Vec<u8>) {
        if let Err(e) = channel.send(&data).await {
            debug!("Echo on channel {} failed: {}", channel.id(), e);
        }
    }
}

/// Bytes received from one inbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: ChannelId,
    pub remote: HardwareAddress,
    pub data: Vec<u8>,
}

/// Delivers inbound bytes to a receiver
#[derive(Debug, Clone)]
pub struct ForwardHandler {
    messages: mpsc::UnboundedSender<InboundMessage>,
}

impl ForwardHandler {
    /// Create a handler and the receiver it forwards to
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (messages, rx) = mpsc::unbounded_channel();
        (Self { messages }, rx)
    }
}

#[async_trait]
impl InboundHandler for ForwardHandler {
    async fn on_inbound(&self, channel: &Arc<DataChannel>, data: Vec<u8>) {
        let message = InboundMessage {
            channel: channel.id(),
            remote: channel.remote(),
            data,
        };
        if self.messages.send(message).is_err() {
            trace!("Inbound receiver dropped");
        }
    }
}

/// Decides whether an accepted remote may keep its channel
pub type Authenticator = Arc<dyn Fn(&HardwareAddress) -> bool + Send + Sync>;

fn accept_all(_remote: &HardwareAddress) -> bool {
    true
}

// ----------------------------------------------------------------------------
// Published Profile
// ----------------------------------------------------------------------------

/// Values answered to characteristic reads
struct PublishedProfile {
    identity: Vec<u8>,
    metadata: Vec<u8>,
    port: Mutex<Option<u16>>,
}

impl PublishedProfile {
    fn port(&self) -> MutexGuard<'_, Option<u16>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CharacteristicReader for PublishedProfile {
    fn read(&self, characteristic: &Uuid) -> std::result::Result<Vec<u8>, GattStatus> {
        if *characteristic == IDENTITY_CHARACTERISTIC_UUID {
            Ok(self.identity.clone())
        } else if *characteristic == PORT_CHARACTERISTIC_UUID {
            Ok(self
                .port()
                .map(|port| encode_port(port).to_vec())
                .unwrap_or_default())
        } else if *characteristic == METADATA_CHARACTERISTIC_UUID {
            Ok(self.metadata.clone())
        } else {
            debug!("Rejecting read of unknown characteristic {}", characteristic);
            Err(GattStatus::FAILURE)
        }
    }
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

type ConnectionSet = Mutex<Option<HashMap<ChannelId, Arc<DataChannel>>>>;

struct Running {
    psm: u16,
    advertisement: Box<dyn Registration>,
    gatt: Box<dyn Registration>,
    stop: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

enum Lifecycle {
    Stopped,
    Starting,
    Running(Running),
}

/// Advertises the local profile and accepts inbound data channels
pub struct LocalServer {
    radio: Arc<dyn PeripheralRadio>,
    config: PeerLinkConfig,
    permissions: Arc<dyn PermissionChecker>,
    inbound: Arc<dyn InboundHandler>,
    authenticate: Authenticator,
    profile: Arc<PublishedProfile>,
    connections: Arc<ConnectionSet>,
    lifecycle: Mutex<Lifecycle>,
}

impl LocalServer {
    /// Create a server that echoes inbound data and accepts every remote
    pub fn new(
        radio: Arc<dyn PeripheralRadio>,
        config: PeerLinkConfig,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        let profile = Arc::new(PublishedProfile {
            identity: config.local_identity.as_bytes().to_vec(),
            metadata: config.metadata.clone(),
            port: Mutex::new(None),
        });

        Self {
            radio,
            config,
            permissions,
            inbound: Arc::new(EchoHandler),
            authenticate: Arc::new(accept_all),
            profile,
            connections: Arc::new(Mutex::new(None)),
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Route inbound data to `handler` instead of echoing it
    pub fn with_inbound_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.inbound = handler;
        self
    }

    /// Reject remotes for which `authenticate` returns false
    pub fn with_authenticator(mut self, authenticate: Authenticator) -> Self {
        self.authenticate = authenticate;
        self
    }

    pub fn identity(&self) -> &str {
        &self.config.local_identity
    }

    /// Port of the listening endpoint while running
    pub fn psm(&self) -> Option<u16> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.psm),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Number of live inbound channels
    pub fn connection_count(&self) -> usize {
        lock_set(&self.connections).as_ref().map_or(0, HashMap::len)
    }

    /// Listen, publish the profile and advertise; returns the assigned port
    pub async fn start(&self) -> Result<u16> {
        permissions::require(self.permissions.as_ref(), SERVER_CAPABILITIES)?;
        self.config.validate()?;

        {
            let mut lifecycle = self.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Stopped) {
                warn!("Server already active, ignoring start request");
                return Err(PeerLinkError::already_active("server"));
            }
            *lifecycle = Lifecycle::Starting;
        }

        match self.open().await {
            Ok(running) => {
                let psm = running.psm;
                *self.lifecycle() = Lifecycle::Running(running);
                info!(
                    "Server {} listening on psm {}",
                    self.config.local_identity, psm
                );
                Ok(psm)
            }
            Err(e) => {
                *self.profile.port() = None;
                *self.lifecycle() = Lifecycle::Stopped;
                warn!("Server failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<Running> {
        let listener = self.radio.listen().await?;
        let psm = listener.psm();
        *self.profile.port() = Some(psm);

        let service = LocalService {
            uuid: SERVICE_UUID,
            characteristics: REQUIRED_CHARACTERISTICS.to_vec(),
            reader: self.profile.clone(),
        };
        let gatt = self.radio.serve_gatt(service).await?;

        let advertisement = Advertisement {
            service_uuids: vec![SERVICE_UUID],
            local_name: self.config.local_name.clone(),
        };
        let advertisement = self.radio.advertise(advertisement).await?;

        *lock_set(&self.connections) = Some(HashMap::new());

        let (stop, stop_rx) = oneshot::channel();
        let acceptor = Acceptor {
            connections: Arc::downgrade(&self.connections),
            inbound: self.inbound.clone(),
            authenticate: self.authenticate.clone(),
            read_buffer_size: self.config.read_buffer_size,
        };
        let accept_task = tokio::spawn(acceptor.run(listener, stop_rx));

        Ok(Running {
            psm,
            advertisement,
            gatt,
            stop,
            accept_task,
        })
    }

    /// Stop advertising, close the listener and every live channel
    ///
    /// A channel that fails to close is logged and does not keep the others
    /// open.
    pub async fn stop(&self) -> Result<()> {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                Lifecycle::Starting => {
                    *lifecycle = Lifecycle::Starting;
                    warn!("Server still starting, ignoring stop request");
                    return Ok(());
                }
                Lifecycle::Stopped => {
                    debug!("Stop requested while server stopped");
                    return Ok(());
                }
            }
        };

        let Running {
            psm,
            advertisement,
            gatt,
            stop,
            accept_task,
        } = running;

        drop(advertisement);
        drop(gatt);
        let _ = stop.send(());
        if let Err(e) = accept_task.await {
            error!("Accept loop ended abnormally: {}", e);
        }
        *self.profile.port() = None;

        let channels = lock_set(&self.connections).take().unwrap_or_default();
        let total = channels.len();
        let mut failed = 0;
        for (id, channel) in channels {
            if let Err(e) = channel.close(None).await {
                failed += 1;
                warn!("Error closing inbound channel {}: {}", id, e);
            }
        }

        info!(
            "Server on psm {} stopped, closed {} channels ({} with errors)",
            psm, total, failed
        );
        Ok(())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_set(set: &ConnectionSet) -> MutexGuard<'_, Option<HashMap<ChannelId, Arc<DataChannel>>>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Accept Loop
// ----------------------------------------------------------------------------

struct Acceptor {
    connections: Weak<ConnectionSet>,
    inbound: Arc<dyn InboundHandler>,
    authenticate: Authenticator,
    read_buffer_size: usize,
}

impl Acceptor {
    async fn run(self, mut listener: Box<dyn ChannelListener>, mut stop: oneshot::Receiver<()>) {
        let psm = listener.psm();
        loop {
            let accepted = tokio::select! {
                _ = &mut stop => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    if !(self.authenticate)(&remote) {
                        warn!("Rejected inbound channel from {}", remote);
                        drop(stream);
                        continue;
                    }
                    self.track(stream, remote);
                }
                Err(e) => {
                    error!("Accept on psm {} failed: {}", psm, e);
                    break;
                }
            }
        }
        drop(listener);
        debug!("Listener on psm {} closed", psm);
    }

    fn track(&self, stream: crate::radio::BoxedStream, remote: HardwareAddress) {
        let Some(connections) = self.connections.upgrade() else {
            return;
        };

        let handler = Arc::new(ServerChannelHandler {
            connections: self.connections.clone(),
            inbound: self.inbound.clone(),
        });
        let channel = DataChannel::open(stream, remote, handler, self.read_buffer_size);

        let tracked = match lock_set(&connections).as_mut() {
            Some(live) => {
                live.insert(channel.id(), channel.clone());
                true
            }
            None => false,
        };

        if !tracked {
            debug!("Server stopping, dropping channel from {}", remote);
            tokio::spawn(async move {
                let _ = channel.close(None).await;
            });
            return;
        }

        // The read loop may already have hit end of stream before the insert.
        if channel.is_closed() {
            if let Some(live) = lock_set(&connections).as_mut() {
                live.remove(&channel.id());
            }
            debug!("Channel from {} closed before it was tracked", remote);
        } else {
            info!("Accepted channel {} from {}", channel.id(), remote);
        }
    }
}

struct ServerChannelHandler {
    connections: Weak<ConnectionSet>,
    inbound: Arc<dyn InboundHandler>,
}

#[async_trait]
impl ChannelHandler for ServerChannelHandler {
    async fn on_data(&self, channel: &Arc<DataChannel>, data: Vec<u8>) {
        self.inbound.on_inbound(channel, data).await;
    }

    fn on_closed(&self, channel: &DataChannel, error: Option<&io::Error>) {
        if let Some(connections) = self.connections.upgrade() {
            if let Some(live) = lock_set(&connections).as_mut() {
                live.remove(&channel.id());
            }
        }
        match error {
            Some(e) => debug!("Inbound channel {} closed: {}", channel.id(), e),
            None => trace!("Inbound channel {} closed", channel.id()),
        }
    }
}
