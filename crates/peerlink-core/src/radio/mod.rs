//! Radio abstraction
//!
//! Central-side requests are synchronous issuers: each call returns as soon as
//! the request is handed to the radio, and the outcome arrives later as a
//! [`GattEvent`] on the sink the link was opened with. Peripheral-side calls
//! are plain async functions awaited by the local server.
//!
//! [`memory`] provides an in-process implementation of both sides.

pub mod memory;

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::ConnectionInput;
use crate::error::RadioError;
use crate::peer::HardwareAddress;

// ----------------------------------------------------------------------------
// Status Codes
// ----------------------------------------------------------------------------

/// Numeric status reported with every hardware callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Transient connect fault reported by flaky radio stacks
    pub const TRANSIENT: GattStatus = GattStatus(133);
    pub const FAILURE: GattStatus = GattStatus(257);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Streams
// ----------------------------------------------------------------------------

/// Byte stream carried by a data channel
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ChannelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ChannelStream>;

// ----------------------------------------------------------------------------
// Hardware Events
// ----------------------------------------------------------------------------

/// Link state carried by [`GattEvent::ConnectionStateChanged`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Characteristic as exposed by a remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    pub readable: bool,
}

/// Service as exposed by a remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub characteristics: Vec<RemoteCharacteristic>,
}

impl RemoteService {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&RemoteCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Hardware callback delivered to one peer connection
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<RemoteService>,
    },
    CharacteristicRead {
        status: GattStatus,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ChannelOpened {
        result: io::Result<BoxedStream>,
    },
}

impl fmt::Debug for GattEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattEvent::ConnectionStateChanged { status, state } => f
                .debug_struct("ConnectionStateChanged")
                .field("status", status)
                .field("state", state)
                .finish(),
            GattEvent::ServicesDiscovered { status, services } => f
                .debug_struct("ServicesDiscovered")
                .field("status", status)
                .field("services", services)
                .finish(),
            GattEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            } => f
                .debug_struct("CharacteristicRead")
                .field("status", status)
                .field("characteristic", characteristic)
                .field("value", value)
                .finish(),
            GattEvent::ChannelOpened { result } => f
                .debug_struct("ChannelOpened")
                .field("ok", &result.is_ok())
                .finish(),
        }
    }
}

/// Delivers hardware callbacks to the peer connection that owns a link
#[derive(Clone)]
pub struct GattEventSink {
    inputs: mpsc::UnboundedSender<ConnectionInput>,
}

impl GattEventSink {
    pub(crate) fn new(inputs: mpsc::UnboundedSender<ConnectionInput>) -> Self {
        Self { inputs }
    }

    /// Deliver an event; returns false once the connection has finished
    pub fn emit(&self, event: GattEvent) -> bool {
        self.inputs.send(ConnectionInput::Gatt(event)).is_ok()
    }
}

impl fmt::Debug for GattEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattEventSink")
            .field("closed", &self.inputs.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub address: HardwareAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Result(ScanRecord),
    Failed { reason: String },
}

/// Delivers scan callbacks to the discovery service
#[derive(Debug, Clone)]
pub struct ScanSink {
    events: mpsc::UnboundedSender<ScanEvent>,
}

impl ScanSink {
    pub fn new(events: mpsc::UnboundedSender<ScanEvent>) -> Self {
        Self { events }
    }

    /// Deliver an event; returns false once nobody is listening
    pub fn emit(&self, event: ScanEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// Central-role radio used by the discovery service
pub trait CentralRadio: Send + Sync + 'static {
    /// Start scanning for advertisements of `service`
    fn start_scan(&self, service: Uuid, sink: ScanSink) -> Result<(), RadioError>;

    fn stop_scan(&self) -> Result<(), RadioError>;

    /// Create the handle used for every request to one remote device
    fn open_link(
        &self,
        address: HardwareAddress,
        sink: GattEventSink,
    ) -> Result<Arc<dyn GattLink>, RadioError>;
}

/// Link to one remote device
pub trait GattLink: Send + Sync {
    fn connect(&self) -> Result<(), RadioError>;

    fn discover_services(&self) -> Result<(), RadioError>;

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError>;

    fn open_channel(&self, psm: u16) -> Result<(), RadioError>;

    /// Release the link; no further events are delivered
    fn close(&self);
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// Answers reads of the local GATT service
pub trait CharacteristicReader: Send + Sync {
    fn read(&self, characteristic: &Uuid) -> Result<Vec<u8>, GattStatus>;
}

/// Local GATT service definition
#[derive(Clone)]
pub struct LocalService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
    pub reader: Arc<dyn CharacteristicReader>,
}

impl LocalService {
    /// Remote view of this service
    pub fn describe(&self) -> RemoteService {
        RemoteService {
            uuid: self.uuid,
            characteristics: self
                .characteristics
                .iter()
                .map(|uuid| RemoteCharacteristic {
                    uuid: *uuid,
                    readable: true,
                })
                .collect(),
        }
    }
}

impl fmt::Debug for LocalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalService")
            .field("uuid", &self.uuid)
            .field("characteristics", &self.characteristics)
            .finish()
    }
}

/// Advertisement payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service_uuids: Vec<Uuid>,
    pub local_name: Option<String>,
}

/// Guard for a registered service or advertisement; dropping it withdraws the registration
pub trait Registration: Send + Sync {}

/// Listening data channel endpoint; dropping it closes the endpoint
#[async_trait]
pub trait ChannelListener: Send {
    /// Port assigned to this endpoint
    fn psm(&self) -> u16;

    async fn accept(&mut self) -> io::Result<(BoxedStream, HardwareAddress)>;
}

/// Peripheral-role radio used by the local server
#[async_trait]
pub trait PeripheralRadio: Send + Sync + 'static {
    async fn serve_gatt(&self, service: LocalService) -> Result<Box<dyn Registration>, RadioError>;

    async fn advertise(
        &self,
        advertisement: Advertisement,
    ) -> Result<Box<dyn Registration>, RadioError>;

    async fn listen(&self) -> Result<Box<dyn ChannelListener>, RadioError>;
}
