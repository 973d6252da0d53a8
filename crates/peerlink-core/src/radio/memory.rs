//! In-process radio
//!
//! A [`MemoryAir`] connects any number of central and peripheral endpoints.
//! Peripherals that advertise the scanned service show up in scans, links
//! answer requests from the peripheral's served profile, and channels are
//! `tokio::io::duplex` pairs handed to the peripheral's listener.
//!
//! A central never sees advertisements from its own address. Requests to an
//! address with no peripheral behind it are recorded but never answered, so
//! tests can deliver events by hand through [`MemoryLink::emit`].

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::{
    Advertisement, BoxedStream, CentralRadio, ChannelListener, GattEvent, GattEventSink,
    GattLink, GattStatus, LinkState, LocalService, PeripheralRadio, Registration, ScanEvent,
    ScanRecord, ScanSink,
};
use crate::error::RadioError;
use crate::peer::HardwareAddress;

const FIRST_DYNAMIC_PSM: u16 = 0x0080;
const CHANNEL_BUFFER: usize = 64 * 1024;

type Inbound = (BoxedStream, HardwareAddress);

struct ListenerSlot {
    psm: u16,
    inbound: mpsc::UnboundedSender<Inbound>,
}

#[derive(Default)]
struct Device {
    name: Option<String>,
    rssi: Option<i16>,
    service: Option<LocalService>,
    advertisement: Option<Advertisement>,
    listener: Option<ListenerSlot>,
    connect_faults: VecDeque<GattStatus>,
}

#[derive(Default)]
struct AirState {
    devices: HashMap<HardwareAddress, Device>,
    scanners: HashMap<HardwareAddress, (Uuid, ScanSink)>,
    links: Vec<Arc<MemoryLink>>,
    next_psm: u16,
}

// ----------------------------------------------------------------------------
// Air
// ----------------------------------------------------------------------------

/// Shared medium for in-process radios
#[derive(Clone, Default)]
pub struct MemoryAir {
    state: Arc<Mutex<AirState>>,
}

impl MemoryAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Central endpoint at `address`
    pub fn central(&self, address: HardwareAddress) -> MemoryCentral {
        MemoryCentral {
            address,
            air: self.clone(),
        }
    }

    /// Peripheral endpoint at `address`, advertising `name` unless the
    /// advertisement carries its own
    pub fn peripheral(&self, address: HardwareAddress, name: Option<&str>) -> MemoryPeripheral {
        {
            let mut state = self.state();
            let device = state.devices.entry(address).or_default();
            device.name = name.map(str::to_string);
            device.rssi = Some(-60);
        }
        MemoryPeripheral {
            address,
            air: self.clone(),
        }
    }

    /// Deliver a scan result to every active scanner regardless of its filter
    pub fn inject_scan(&self, record: ScanRecord) {
        let sinks: Vec<ScanSink> = self
            .state()
            .scanners
            .values()
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink.emit(ScanEvent::Result(record.clone()));
        }
    }

    /// Fail every active scan
    pub fn fail_scans(&self, reason: &str) {
        let sinks: Vec<ScanSink> = self
            .state()
            .scanners
            .drain()
            .map(|(_, (_, sink))| sink)
            .collect();
        for sink in sinks {
            sink.emit(ScanEvent::Failed {
                reason: reason.to_string(),
            });
        }
    }

    /// Answer the next `count` connects to `address` with `status`
    pub fn fail_connects(&self, address: HardwareAddress, status: GattStatus, count: usize) {
        let mut state = self.state();
        let device = state.devices.entry(address).or_default();
        device.connect_faults.extend(std::iter::repeat(status).take(count));
    }

    /// Every link opened to `address`, oldest first
    pub fn links_to(&self, address: HardwareAddress) -> Vec<Arc<MemoryLink>> {
        self.state()
            .links
            .iter()
            .filter(|link| link.remote == address)
            .cloned()
            .collect()
    }

    pub fn is_scanning(&self, central: HardwareAddress) -> bool {
        self.state().scanners.contains_key(&central)
    }

    pub fn is_advertising(&self, address: HardwareAddress) -> bool {
        self.device(address, |device| device.advertisement.is_some())
    }

    pub fn is_serving(&self, address: HardwareAddress) -> bool {
        self.device(address, |device| device.service.is_some())
    }

    pub fn is_listening(&self, address: HardwareAddress) -> bool {
        self.device(address, |device| device.listener.is_some())
    }

    /// Read a characteristic of the profile served at `address`
    pub fn read(
        &self,
        address: HardwareAddress,
        characteristic: &Uuid,
    ) -> Option<Result<Vec<u8>, GattStatus>> {
        let service = self.served(address)?;
        Some(service.reader.read(characteristic))
    }

    fn device<T: Default>(&self, address: HardwareAddress, f: impl FnOnce(&Device) -> T) -> T {
        self.state().devices.get(&address).map(f).unwrap_or_default()
    }

    fn served(&self, address: HardwareAddress) -> Option<LocalService> {
        self.state()
            .devices
            .get(&address)
            .and_then(|device| device.service.clone())
    }

    /// Hand a stream to the listener at `address` if it uses `psm`
    fn dial(&self, address: HardwareAddress, psm: Option<u16>, inbound: Inbound) -> io::Result<()> {
        let state = self.state();
        let listener = state
            .devices
            .get(&address)
            .and_then(|device| device.listener.as_ref())
            .filter(|listener| psm.map_or(true, |psm| psm == listener.psm))
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?;

        listener
            .inbound
            .send(inbound)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))
    }

    fn state(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Central
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryCentral {
    address: HardwareAddress,
    air: MemoryAir,
}

impl MemoryCentral {
    pub fn address(&self) -> HardwareAddress {
        self.address
    }
}

impl CentralRadio for MemoryCentral {
    fn start_scan(&self, service: Uuid, sink: ScanSink) -> Result<(), RadioError> {
        let records: Vec<ScanRecord> = {
            let mut state = self.air.state();
            state.scanners.insert(self.address, (service, sink.clone()));
            state
                .devices
                .iter()
                .filter(|(address, _)| **address != self.address)
                .filter_map(|(address, device)| {
                    let ad = device.advertisement.as_ref()?;
                    ad.service_uuids.contains(&service).then(|| ScanRecord {
                        address: *address,
                        name: ad.local_name.clone().or_else(|| device.name.clone()),
                        rssi: device.rssi,
                    })
                })
                .collect()
        };

        for record in records {
            sink.emit(ScanEvent::Result(record));
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        self.air.state().scanners.remove(&self.address);
        Ok(())
    }

    fn open_link(
        &self,
        address: HardwareAddress,
        sink: GattEventSink,
    ) -> Result<Arc<dyn GattLink>, RadioError> {
        let link = Arc::new(MemoryLink {
            local: self.address,
            remote: address,
            air: self.air.clone(),
            sink,
            requests: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.air.state().links.push(link.clone());
        Ok(link)
    }
}

/// Request recorded by a [`MemoryLink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    Connect,
    DiscoverServices,
    ReadCharacteristic(Uuid),
    OpenChannel(u16),
    Close,
}

/// Link from a [`MemoryCentral`] to one address
pub struct MemoryLink {
    local: HardwareAddress,
    remote: HardwareAddress,
    air: MemoryAir,
    sink: GattEventSink,
    requests: Mutex<Vec<LinkRequest>>,
    closed: AtomicBool,
}

impl MemoryLink {
    pub fn remote(&self) -> HardwareAddress {
        self.remote
    }

    pub fn requests(&self) -> Vec<LinkRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, request: &LinkRequest) -> usize {
        self.requests().iter().filter(|r| *r == request).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver a hardware event to the connection that opened this link
    pub fn emit(&self, event: GattEvent) -> bool {
        self.sink.emit(event)
    }

    fn record(&self, request: LinkRequest) -> Result<(), RadioError> {
        trace!("{} -> {}: {:?}", self.local, self.remote, request);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        if self.is_closed() {
            return Err(RadioError::Unavailable("link closed".to_string()));
        }
        Ok(())
    }

    fn answered(&self) -> bool {
        self.air.state().devices.contains_key(&self.remote)
    }
}

impl GattLink for MemoryLink {
    fn connect(&self) -> Result<(), RadioError> {
        self.record(LinkRequest::Connect)?;
        if !self.answered() {
            return Ok(());
        }

        let fault = self
            .air
            .state()
            .devices
            .get_mut(&self.remote)
            .and_then(|device| device.connect_faults.pop_front());
        let event = match fault {
            Some(status) => GattEvent::ConnectionStateChanged {
                status,
                state: LinkState::Disconnected,
            },
            None => GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkState::Connected,
            },
        };
        self.emit(event);
        Ok(())
    }

    fn discover_services(&self) -> Result<(), RadioError> {
        self.record(LinkRequest::DiscoverServices)?;
        if !self.answered() {
            return Ok(());
        }

        let services = self
            .air
            .served(self.remote)
            .map(|service| vec![service.describe()])
            .unwrap_or_default();
        self.emit(GattEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services,
        });
        Ok(())
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError> {
        self.record(LinkRequest::ReadCharacteristic(characteristic))?;
        if !self.answered() {
            return Ok(());
        }

        let event = match self.air.served(self.remote).filter(|s| s.uuid == service) {
            Some(served) => match served.reader.read(&characteristic) {
                Ok(value) => GattEvent::CharacteristicRead {
                    status: GattStatus::SUCCESS,
                    characteristic,
                    value,
                },
                Err(status) => GattEvent::CharacteristicRead {
                    status,
                    characteristic,
                    value: Vec::new(),
                },
            },
            None => GattEvent::CharacteristicRead {
                status: GattStatus::FAILURE,
                characteristic,
                value: Vec::new(),
            },
        };
        self.emit(event);
        Ok(())
    }

    fn open_channel(&self, psm: u16) -> Result<(), RadioError> {
        self.record(LinkRequest::OpenChannel(psm))?;
        if !self.answered() {
            return Ok(());
        }

        let (client, server) = tokio::io::duplex(CHANNEL_BUFFER);
        let result = self
            .air
            .dial(self.remote, Some(psm), (Box::new(server), self.local))
            .map(|()| Box::new(client) as BoxedStream);
        self.emit(GattEvent::ChannelOpened { result });
        Ok(())
    }

    fn close(&self) {
        let _ = self.record(LinkRequest::Close);
        self.closed.store(true, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// Peripheral
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryPeripheral {
    address: HardwareAddress,
    air: MemoryAir,
}

impl MemoryPeripheral {
    pub fn address(&self) -> HardwareAddress {
        self.address
    }

    /// Open a channel to this peripheral's listener from `from`
    pub fn dial(&self, from: HardwareAddress) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(CHANNEL_BUFFER);
        self.air.dial(self.address, None, (Box::new(server), from))?;
        Ok(client)
    }

    /// Hand an arbitrary stream to this peripheral's listener
    pub fn dial_stream(&self, from: HardwareAddress, stream: BoxedStream) -> io::Result<()> {
        self.air.dial(self.address, None, (stream, from))
    }
}

#[derive(Debug, Clone, Copy)]
enum RegistrationKind {
    Gatt,
    Advertisement,
}

struct MemoryRegistration {
    air: MemoryAir,
    address: HardwareAddress,
    kind: RegistrationKind,
}

impl Registration for MemoryRegistration {}

impl Drop for MemoryRegistration {
    fn drop(&mut self) {
        let mut state = self.air.state();
        if let Some(device) = state.devices.get_mut(&self.address) {
            match self.kind {
                RegistrationKind::Gatt => device.service = None,
                RegistrationKind::Advertisement => device.advertisement = None,
            }
        }
        trace!("{}: {:?} registration withdrawn", self.address, self.kind);
    }
}

struct MemoryListener {
    air: MemoryAir,
    address: HardwareAddress,
    psm: u16,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl ChannelListener for MemoryListener {
    fn psm(&self) -> u16 {
        self.psm
    }

    async fn accept(&mut self) -> io::Result<Inbound> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut state = self.air.state();
        if let Some(device) = state.devices.get_mut(&self.address) {
            if device.listener.as_ref().map(|l| l.psm) == Some(self.psm) {
                device.listener = None;
            }
        }
    }
}

#[async_trait]
impl PeripheralRadio for MemoryPeripheral {
    async fn serve_gatt(&self, service: LocalService) -> Result<Box<dyn Registration>, RadioError> {
        self.air
            .state()
            .devices
            .entry(self.address)
            .or_default()
            .service = Some(service);
        Ok(Box::new(MemoryRegistration {
            air: self.air.clone(),
            address: self.address,
            kind: RegistrationKind::Gatt,
        }))
    }

    async fn advertise(
        &self,
        advertisement: Advertisement,
    ) -> Result<Box<dyn Registration>, RadioError> {
        let deliveries: Vec<(ScanSink, ScanRecord)> = {
            let mut state = self.air.state();
            let device = state.devices.entry(self.address).or_default();
            if device.advertisement.is_some() {
                return Err(RadioError::Unavailable("already advertising".to_string()));
            }
            device.advertisement = Some(advertisement.clone());
            let record = ScanRecord {
                address: self.address,
                name: advertisement.local_name.clone().or_else(|| device.name.clone()),
                rssi: device.rssi,
            };

            state
                .scanners
                .iter()
                .filter(|(scanner, (service, _))| {
                    **scanner != self.address && advertisement.service_uuids.contains(service)
                })
                .map(|(_, (_, sink))| (sink.clone(), record.clone()))
                .collect()
        };

        for (sink, record) in deliveries {
            sink.emit(ScanEvent::Result(record));
        }
        Ok(Box::new(MemoryRegistration {
            air: self.air.clone(),
            address: self.address,
            kind: RegistrationKind::Advertisement,
        }))
    }

    async fn listen(&self) -> Result<Box<dyn ChannelListener>, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let psm = {
            let mut state = self.air.state();
            let psm = state.next_psm.max(FIRST_DYNAMIC_PSM);
            state.next_psm = psm.wrapping_add(1);

            let device = state.devices.entry(self.address).or_default();
            if device.listener.is_some() {
                return Err(RadioError::Unavailable("already listening".to_string()));
            }
            device.listener = Some(ListenerSlot { psm, inbound: tx });
            psm
        };

        Ok(Box::new(MemoryListener {
            air: self.air.clone(),
            address: self.address,
            psm,
            inbound: rx,
        }))
    }
}
