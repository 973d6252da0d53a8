//! Handshake state machine
//!
//! [`Handshake`] is the single transition function behind every peer
//! connection. It is synchronous and owns no resources: each hardware callback
//! or request is applied as a [`HandshakeEvent`], and the caller performs the
//! returned [`HandshakeAction`]s in order.
//!
//! States advance strictly one step at a time:
//!
//! ```text
//! Discovered -> Connecting -> FetchingServices -> FetchingCharacteristics
//!            -> Connected -> OpeningChannel -> ChannelOpen
//! ```
//!
//! `Disconnected` and `Failed` are terminal and reachable from anywhere. Any
//! other transition is a protocol violation and fails the connection. Once
//! terminal, every further event is ignored.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PeerLinkError, Result};
use crate::peer::HardwareAddress;
use crate::protocol::{
    characteristic_name, decode_identity, decode_port, IDENTITY_CHARACTERISTIC_UUID,
    METADATA_CHARACTERISTIC_UUID, PORT_CHARACTERISTIC_UUID, REQUIRED_CHARACTERISTICS,
    SERVICE_UUID,
};
use crate::radio::{GattStatus, LinkState, RemoteService};

// ----------------------------------------------------------------------------
// States
// ----------------------------------------------------------------------------

/// Lifecycle state of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    FetchingServices,
    FetchingCharacteristics,
    Connected,
    OpeningChannel,
    ChannelOpen,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// The only non-terminal state reachable from `self`
    pub fn successor(self) -> Option<ConnectionState> {
        use ConnectionState::*;
        match self {
            Discovered => Some(Connecting),
            Connecting => Some(FetchingServices),
            FetchingServices => Some(FetchingCharacteristics),
            FetchingCharacteristics => Some(Connected),
            Connected => Some(OpeningChannel),
            OpeningChannel => Some(ChannelOpen),
            ChannelOpen | Disconnected | Failed => None,
        }
    }

    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        !self.is_terminal() && (target.is_terminal() || self.successor() == Some(target))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ----------------------------------------------------------------------------
// Failure Reasons
// ----------------------------------------------------------------------------

/// Why a connection ended in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("{step} failed with status {status}")]
    Status {
        step: &'static str,
        status: GattStatus,
    },

    #[error("gave up after {retries} connect retries")]
    RetriesExhausted { retries: u32 },

    #[error("peer does not expose the namespace service")]
    ServiceMissing,

    #[error("characteristic {0} missing")]
    CharacteristicMissing(Uuid),

    #[error("characteristic {0} is not readable")]
    CharacteristicUnreadable(Uuid),

    #[error("unexpected read of characteristic {0}")]
    UnexpectedRead(Uuid),

    #[error("invalid {field} value {value:02X?}")]
    InvalidValue { field: &'static str, value: Vec<u8> },

    #[error("{event} in state {state}")]
    UnexpectedEvent {
        event: &'static str,
        state: ConnectionState,
    },

    #[error("channel open failed: {0}")]
    ChannelOpenFailed(String),

    #[error("radio request failed: {0}")]
    Request(String),

    #[error("closed by owner")]
    Closed,
}

// ----------------------------------------------------------------------------
// Events and Actions
// ----------------------------------------------------------------------------

/// Input to [`Handshake::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Owner asked to start the handshake
    Connect,
    LinkStateChanged {
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
    ChannelOpened,
    ChannelOpenFailed(String),
    /// The open data channel ended
    ChannelClosed,
    /// A hardware request could not be issued
    RequestFailed(String),
    /// Owner tears the connection down; anything but `Disconnected` is a failure
    Close(ConnectionState),
}

/// Work the connection shell performs after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    Connect,
    DiscoverServices,
    ReadCharacteristic { service: Uuid, characteristic: Uuid },
    OpenChannel { psm: u16 },
    /// Wrap the stream that just opened in a data channel
    AttachChannel,
    NotifyFound,
    NotifyChannelReady,
    /// Release everything; emitted at most once
    Close { state: ConnectionState },
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

/// Per-peer handshake progress and learned values
#[derive(Debug, Clone)]
pub struct Handshake {
    address: HardwareAddress,
    state: ConnectionState,
    retries: u32,
    max_retries: u32,
    retryable: GattStatus,
    required: VecDeque<Uuid>,
    pending_read: Option<Uuid>,
    service: Option<RemoteService>,
    identity: Option<String>,
    port: Option<u16>,
    metadata: Option<Vec<u8>>,
    failure: Option<FailureReason>,
}

impl Handshake {
    pub fn new(address: HardwareAddress, max_retries: u32, retryable: GattStatus) -> Self {
        Self {
            address,
            state: ConnectionState::Discovered,
            retries: 0,
            max_retries,
            retryable,
            required: VecDeque::new(),
            pending_read: None,
            service: None,
            identity: None,
            port: None,
            metadata: None,
            failure: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// Apply one event and return the actions it requires
    pub fn apply(&mut self, event: HandshakeEvent) -> Vec<HandshakeAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            debug!("{}: ignoring {:?} after {}", self.address, event, self.state);
            return actions;
        }

        match event {
            HandshakeEvent::Connect => {
                if self.transition(ConnectionState::Connecting, &mut actions) {
                    actions.push(HandshakeAction::Connect);
                }
            }
            HandshakeEvent::LinkStateChanged { status, state } => {
                self.on_link_state(status, state, &mut actions)
            }
            HandshakeEvent::ServicesDiscovered { status, services } => {
                self.on_services(status, services, &mut actions)
            }
            HandshakeEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            } => self.on_read(status, characteristic, value, &mut actions),
            HandshakeEvent::ChannelOpened => {
                if self.transition(ConnectionState::ChannelOpen, &mut actions) {
                    actions.push(HandshakeAction::AttachChannel);
                    actions.push(HandshakeAction::NotifyChannelReady);
                }
            }
            HandshakeEvent::ChannelOpenFailed(reason) => {
                self.fail(FailureReason::ChannelOpenFailed(reason), &mut actions)
            }
            HandshakeEvent::ChannelClosed => {
                if self.state == ConnectionState::ChannelOpen {
                    self.close(ConnectionState::Disconnected, &mut actions);
                } else {
                    self.fail(
                        FailureReason::UnexpectedEvent {
                            event: "channel closed",
                            state: self.state,
                        },
                        &mut actions,
                    );
                }
            }
            HandshakeEvent::RequestFailed(reason) => {
                self.fail(FailureReason::Request(reason), &mut actions)
            }
            HandshakeEvent::Close(state) => {
                if state == ConnectionState::Disconnected {
                    self.close(state, &mut actions);
                } else {
                    self.fail(FailureReason::Closed, &mut actions);
                }
            }
        }
        actions
    }

    /// Request a data channel; only valid once connected with a known port
    pub fn open_channel(&mut self) -> Result<Vec<HandshakeAction>> {
        if self.state != ConnectionState::Connected {
            return Err(PeerLinkError::invalid_state("open channel", self.state));
        }
        let psm = self.port.ok_or(PeerLinkError::PortUnknown)?;

        let mut actions = Vec::new();
        if self.transition(ConnectionState::OpeningChannel, &mut actions) {
            actions.push(HandshakeAction::OpenChannel { psm });
        }
        Ok(actions)
    }

    fn on_link_state(
        &mut self,
        status: GattStatus,
        link: LinkState,
        actions: &mut Vec<HandshakeAction>,
    ) {
        if status.is_success() {
            match link {
                LinkState::Connected => {
                    if self.transition(ConnectionState::FetchingServices, actions) {
                        actions.push(HandshakeAction::DiscoverServices);
                    }
                }
                LinkState::Disconnected => self.close(ConnectionState::Disconnected, actions),
            }
            return;
        }

        if status == self.retryable && self.state == ConnectionState::Connecting {
            if self.retries < self.max_retries {
                self.retries += 1;
                debug!(
                    "{}: transient connect fault {}, retry {}/{}",
                    self.address, status, self.retries, self.max_retries
                );
                actions.push(HandshakeAction::Connect);
            } else {
                self.fail(
                    FailureReason::RetriesExhausted {
                        retries: self.retries,
                    },
                    actions,
                );
            }
            return;
        }

        self.fail(
            FailureReason::Status {
                step: "connect",
                status,
            },
            actions,
        );
    }

    fn on_services(
        &mut self,
        status: GattStatus,
        services: Vec<RemoteService>,
        actions: &mut Vec<HandshakeAction>,
    ) {
        if self.state != ConnectionState::FetchingServices {
            return self.fail(
                FailureReason::UnexpectedEvent {
                    event: "services discovered",
                    state: self.state,
                },
                actions,
            );
        }
        if !status.is_success() {
            return self.fail(
                FailureReason::Status {
                    step: "service discovery",
                    status,
                },
                actions,
            );
        }

        let Some(service) = services.into_iter().find(|s| s.uuid == SERVICE_UUID) else {
            return self.fail(FailureReason::ServiceMissing, actions);
        };

        if self.transition(ConnectionState::FetchingCharacteristics, actions) {
            self.service = Some(service);
            self.required = REQUIRED_CHARACTERISTICS.into_iter().collect();
            self.read_next(actions);
        }
    }

    fn on_read(
        &mut self,
        status: GattStatus,
        characteristic: Uuid,
        value: Vec<u8>,
        actions: &mut Vec<HandshakeAction>,
    ) {
        if self.state != ConnectionState::FetchingCharacteristics {
            return self.fail(
                FailureReason::UnexpectedEvent {
                    event: "characteristic read",
                    state: self.state,
                },
                actions,
            );
        }
        if self.pending_read != Some(characteristic) {
            return self.fail(FailureReason::UnexpectedRead(characteristic), actions);
        }
        if !status.is_success() {
            return self.fail(
                FailureReason::Status {
                    step: "characteristic read",
                    status,
                },
                actions,
            );
        }
        self.pending_read = None;

        match characteristic {
            IDENTITY_CHARACTERISTIC_UUID => match decode_identity(&value) {
                Some(identity) => self.identity = Some(identity),
                None => {
                    return self.fail(
                        FailureReason::InvalidValue {
                            field: "identity",
                            value,
                        },
                        actions,
                    )
                }
            },
            PORT_CHARACTERISTIC_UUID => match decode_port(&value) {
                Some(port) => self.port = Some(port),
                None => {
                    return self.fail(
                        FailureReason::InvalidValue {
                            field: "port",
                            value,
                        },
                        actions,
                    )
                }
            },
            METADATA_CHARACTERISTIC_UUID => self.metadata = Some(value),
            other => return self.fail(FailureReason::UnexpectedRead(other), actions),
        }

        if self.read_next(actions) || self.state.is_terminal() {
            return;
        }
        if self.transition(ConnectionState::Connected, actions) {
            actions.push(HandshakeAction::NotifyFound);
        }
    }

    /// Issue the next required read; false once the list is exhausted
    fn read_next(&mut self, actions: &mut Vec<HandshakeAction>) -> bool {
        let Some(characteristic) = self.required.pop_front() else {
            return false;
        };
        let lookup = self.service.as_ref().map(|service| {
            let readable = service.characteristic(&characteristic).map(|c| c.readable);
            (service.uuid, readable)
        });

        match lookup {
            None => {
                self.fail(FailureReason::ServiceMissing, actions);
                false
            }
            Some((_, None)) => {
                self.fail(FailureReason::CharacteristicMissing(characteristic), actions);
                false
            }
            Some((_, Some(false))) => {
                self.fail(FailureReason::CharacteristicUnreadable(characteristic), actions);
                false
            }
            Some((service, Some(true))) => {
                debug!(
                    "{}: reading {}",
                    self.address,
                    characteristic_name(&characteristic).unwrap_or("characteristic")
                );
                self.pending_read = Some(characteristic);
                actions.push(HandshakeAction::ReadCharacteristic {
                    service,
                    characteristic,
                });
                true
            }
        }
    }

    fn transition(&mut self, target: ConnectionState, actions: &mut Vec<HandshakeAction>) -> bool {
        if !self.state.can_transition_to(target) {
            self.fail(
                FailureReason::IllegalTransition {
                    from: self.state,
                    to: target,
                },
                actions,
            );
            return false;
        }
        debug!("{}: {} -> {}", self.address, self.state, target);
        self.state = target;
        self.retries = 0;
        true
    }

    fn fail(&mut self, reason: FailureReason, actions: &mut Vec<HandshakeAction>) {
        if self.state.is_terminal() {
            return;
        }
        warn!("{}: connection failed in {}: {}", self.address, self.state, reason);
        self.failure = Some(reason);
        self.close(ConnectionState::Failed, actions);
    }

    fn close(&mut self, state: ConnectionState, actions: &mut Vec<HandshakeAction>) {
        if self.state.is_terminal() {
            return;
        }
        debug!("{}: {} -> {}", self.address, self.state, state);
        self.state = state;
        self.pending_read = None;
        self.required.clear();
        actions.push(HandshakeAction::Close { state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RemoteCharacteristic;

    const ADDR: HardwareAddress = HardwareAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);

    fn handshake() -> Handshake {
        Handshake::new(ADDR, 3, GattStatus::TRANSIENT)
    }

    fn namespace_service() -> RemoteService {
        RemoteService {
            uuid: SERVICE_UUID,
            characteristics: REQUIRED_CHARACTERISTICS
                .iter()
                .map(|uuid| RemoteCharacteristic {
                    uuid: *uuid,
                    readable: true,
                })
                .collect(),
        }
    }

    fn link_up() -> HandshakeEvent {
        HandshakeEvent::LinkStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        }
    }

    fn read(characteristic: Uuid, value: &[u8]) -> HandshakeEvent {
        HandshakeEvent::CharacteristicRead {
            status: GattStatus::SUCCESS,
            characteristic,
            value: value.to_vec(),
        }
    }

    fn connected() -> Handshake {
        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        hs.apply(link_up());
        hs.apply(HandshakeEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services: vec![namespace_service()],
        });
        hs.apply(read(IDENTITY_CHARACTERISTIC_UUID, b"peer-42"));
        hs.apply(read(PORT_CHARACTERISTIC_UUID, &[0x1F, 0x90]));
        hs.apply(read(METADATA_CHARACTERISTIC_UUID, &[]));
        hs
    }

    #[test]
    fn successor_chain_is_linear() {
        let mut state = ConnectionState::Discovered;
        let mut seen = vec![state];
        while let Some(next) = state.successor() {
            assert!(state.can_transition_to(next));
            state = next;
            seen.push(state);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(state, ConnectionState::ChannelOpen);
        assert!(!ConnectionState::Discovered.can_transition_to(ConnectionState::Connected));
        assert!(ConnectionState::Connecting.can_transition_to(ConnectionState::Failed));
        assert!(!ConnectionState::Failed.can_transition_to(ConnectionState::Disconnected));
    }

    #[test]
    fn successful_handshake_reads_in_order() {
        let mut hs = handshake();
        assert_eq!(hs.apply(HandshakeEvent::Connect), vec![HandshakeAction::Connect]);
        assert_eq!(hs.apply(link_up()), vec![HandshakeAction::DiscoverServices]);

        let actions = hs.apply(HandshakeEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services: vec![namespace_service()],
        });
        assert_eq!(
            actions,
            vec![HandshakeAction::ReadCharacteristic {
                service: SERVICE_UUID,
                characteristic: IDENTITY_CHARACTERISTIC_UUID
            }]
        );

        let actions = hs.apply(read(IDENTITY_CHARACTERISTIC_UUID, b"peer-42"));
        assert_eq!(
            actions,
            vec![HandshakeAction::ReadCharacteristic {
                service: SERVICE_UUID,
                characteristic: PORT_CHARACTERISTIC_UUID
            }]
        );
        let actions = hs.apply(read(PORT_CHARACTERISTIC_UUID, &[0x1F, 0x90]));
        assert_eq!(
            actions,
            vec![HandshakeAction::ReadCharacteristic {
                service: SERVICE_UUID,
                characteristic: METADATA_CHARACTERISTIC_UUID
            }]
        );
        let actions = hs.apply(read(METADATA_CHARACTERISTIC_UUID, &[]));
        assert_eq!(actions, vec![HandshakeAction::NotifyFound]);

        assert_eq!(hs.state(), ConnectionState::Connected);
        assert_eq!(hs.identity(), Some("peer-42"));
        assert_eq!(hs.port(), Some(8080));
        assert_eq!(hs.metadata(), Some(&[][..]));
    }

    #[test]
    fn missing_service_fails_without_reads() {
        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        hs.apply(link_up());
        let actions = hs.apply(HandshakeEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services: vec![RemoteService {
                uuid: Uuid::from_u128(1),
                characteristics: Vec::new(),
            }],
        });

        assert_eq!(
            actions,
            vec![HandshakeAction::Close {
                state: ConnectionState::Failed
            }]
        );
        assert_eq!(hs.failure(), Some(&FailureReason::ServiceMissing));
    }

    #[test]
    fn transient_fault_retries_exactly_three_times() {
        let mut hs = handshake();
        let mut connects = hs
            .apply(HandshakeEvent::Connect)
            .iter()
            .filter(|a| **a == HandshakeAction::Connect)
            .count();

        let fault = HandshakeEvent::LinkStateChanged {
            status: GattStatus::TRANSIENT,
            state: LinkState::Disconnected,
        };
        for _ in 0..10 {
            let actions = hs.apply(fault.clone());
            connects += actions
                .iter()
                .filter(|a| **a == HandshakeAction::Connect)
                .count();
        }

        assert_eq!(connects, 4);
        assert_eq!(hs.state(), ConnectionState::Failed);
        assert_eq!(
            hs.failure(),
            Some(&FailureReason::RetriesExhausted { retries: 3 })
        );
    }

    #[test]
    fn other_status_fails_immediately() {
        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        let actions = hs.apply(HandshakeEvent::LinkStateChanged {
            status: GattStatus(8),
            state: LinkState::Disconnected,
        });

        assert_eq!(
            actions,
            vec![HandshakeAction::Close {
                state: ConnectionState::Failed
            }]
        );
        assert_eq!(hs.retries(), 0);
    }

    #[test]
    fn retry_counter_resets_on_transition() {
        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        hs.apply(HandshakeEvent::LinkStateChanged {
            status: GattStatus::TRANSIENT,
            state: LinkState::Disconnected,
        });
        assert_eq!(hs.retries(), 1);

        hs.apply(link_up());
        assert_eq!(hs.state(), ConnectionState::FetchingServices);
        assert_eq!(hs.retries(), 0);
    }

    #[test]
    fn duplicate_link_up_is_a_violation() {
        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        hs.apply(link_up());
        let actions = hs.apply(link_up());

        assert_eq!(
            actions,
            vec![HandshakeAction::Close {
                state: ConnectionState::Failed
            }]
        );
        assert!(matches!(
            hs.failure(),
            Some(FailureReason::IllegalTransition { .. })
        ));
    }

    #[test]
    fn out_of_order_read_fails() {
        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        hs.apply(link_up());
        hs.apply(HandshakeEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services: vec![namespace_service()],
        });

        hs.apply(read(PORT_CHARACTERISTIC_UUID, &[0x1F, 0x90]));
        assert_eq!(hs.state(), ConnectionState::Failed);
        assert_eq!(
            hs.failure(),
            Some(&FailureReason::UnexpectedRead(PORT_CHARACTERISTIC_UUID))
        );
    }

    #[test]
    fn unreadable_characteristic_fails() {
        let mut service = namespace_service();
        service.characteristics[1].readable = false;

        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        hs.apply(link_up());
        hs.apply(HandshakeEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services: vec![service],
        });
        let actions = hs.apply(read(IDENTITY_CHARACTERISTIC_UUID, b"peer-42"));

        assert_eq!(
            actions,
            vec![HandshakeAction::Close {
                state: ConnectionState::Failed
            }]
        );
        assert_eq!(
            hs.failure(),
            Some(&FailureReason::CharacteristicUnreadable(
                PORT_CHARACTERISTIC_UUID
            ))
        );
    }

    #[test]
    fn malformed_port_fails() {
        let mut hs = handshake();
        hs.apply(HandshakeEvent::Connect);
        hs.apply(link_up());
        hs.apply(HandshakeEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services: vec![namespace_service()],
        });
        hs.apply(read(IDENTITY_CHARACTERISTIC_UUID, b"peer-42"));
        hs.apply(read(PORT_CHARACTERISTIC_UUID, &[0x1F]));

        assert_eq!(hs.state(), ConnectionState::Failed);
        assert!(matches!(
            hs.failure(),
            Some(FailureReason::InvalidValue { field: "port", .. })
        ));
    }

    #[test]
    fn open_channel_requires_connected() {
        let mut hs = handshake();
        assert!(matches!(
            hs.open_channel(),
            Err(PeerLinkError::InvalidState { .. })
        ));
        assert_eq!(hs.state(), ConnectionState::Discovered);

        let mut hs = connected();
        assert_eq!(
            hs.open_channel().unwrap(),
            vec![HandshakeAction::OpenChannel { psm: 8080 }]
        );
        assert_eq!(
            hs.apply(HandshakeEvent::ChannelOpened),
            vec![
                HandshakeAction::AttachChannel,
                HandshakeAction::NotifyChannelReady
            ]
        );
        assert_eq!(hs.state(), ConnectionState::ChannelOpen);
    }

    #[test]
    fn channel_close_disconnects() {
        let mut hs = connected();
        hs.open_channel().unwrap();
        hs.apply(HandshakeEvent::ChannelOpened);

        assert_eq!(
            hs.apply(HandshakeEvent::ChannelClosed),
            vec![HandshakeAction::Close {
                state: ConnectionState::Disconnected
            }]
        );
    }

    #[test]
    fn close_is_emitted_once() {
        let mut hs = connected();
        assert_eq!(
            hs.apply(HandshakeEvent::Close(ConnectionState::Disconnected)),
            vec![HandshakeAction::Close {
                state: ConnectionState::Disconnected
            }]
        );
        assert!(hs
            .apply(HandshakeEvent::Close(ConnectionState::Failed))
            .is_empty());
        assert!(hs.apply(link_up()).is_empty());
        assert_eq!(hs.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn link_drop_disconnects_cleanly() {
        let mut hs = connected();
        let actions = hs.apply(HandshakeEvent::LinkStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Disconnected,
        });
        assert_eq!(
            actions,
            vec![HandshakeAction::Close {
                state: ConnectionState::Disconnected
            }]
        );
        assert!(hs.failure().is_none());
    }
}
