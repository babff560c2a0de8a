//! Transport Abstraction
//!
//! Capability set over a single physical link. Every radio operation returns
//! immediately; its completion arrives later as a [`TransportEvent`] on the
//! channel the backend was built with.

use crate::domain::models::{DiscoveredCharacteristic, Peer, SessionId};
use crate::infrastructure::bluetooth::scanner::DiscoveryEvent;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// Handle to one opened link, tagged with the session generation that opened it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    session: SessionId,
}

impl LinkHandle {
    pub fn new(session: SessionId) -> Self {
        Self { session }
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.session)
    }
}

/// Completion status of an asynchronous GATT operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// Platform- or stack-specific failure code
    Failure(u16),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => f.write_str("success"),
            GattStatus::Failure(code) => write!(f, "failure (0x{:04X})", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bluetooth permission not granted")]
    PermissionDenied,
    #[error("Link error: {0}")]
    LinkError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// The link is established
    LinkUp,
    /// The link went away (peer or local teardown)
    LinkDown,
    /// The link could not be established
    LinkFailed(String),
    ServicesDiscovered(Result<Vec<DiscoveredCharacteristic>, GattStatus>),
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        result: Result<Vec<u8>, GattStatus>,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub handle: LinkHandle,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(handle: LinkHandle, kind: TransportEventKind) -> Self {
        Self { handle, kind }
    }
}

/// Radio link to one peer
///
/// Implementations must not block: work is handed to the radio and completes
/// through the event channel.
pub trait Transport: Send {
    /// Begin opening a link. `LinkUp` or `LinkFailed` follows.
    fn open(&mut self, peer: &Peer, session: SessionId) -> Result<LinkHandle, TransportError>;

    /// Tear the link down. Idempotent; failures are swallowed.
    fn close(&mut self, handle: LinkHandle);

    fn discover_services(&mut self, handle: LinkHandle);

    fn write_descriptor(
        &mut self,
        handle: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    );

    fn read_characteristic(&mut self, handle: LinkHandle, characteristic: Uuid);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, peer: &Peer, session: SessionId) -> Result<LinkHandle, TransportError> {
        (**self).open(peer, session)
    }

    fn close(&mut self, handle: LinkHandle) {
        (**self).close(handle)
    }

    fn discover_services(&mut self, handle: LinkHandle) {
        (**self).discover_services(handle)
    }

    fn write_descriptor(
        &mut self,
        handle: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) {
        (**self).write_descriptor(handle, characteristic, descriptor, value)
    }

    fn read_characteristic(&mut self, handle: LinkHandle, characteristic: Uuid) {
        (**self).read_characteristic(handle, characteristic)
    }
}

/// Producer side of the radio event channels, handed to a backend
#[derive(Debug, Clone)]
pub struct RadioSenders {
    pub transport: mpsc::UnboundedSender<TransportEvent>,
    pub discovery: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl RadioSenders {
    /// Deliver a link event. A closed channel means nobody is listening any more.
    pub fn link(&self, handle: LinkHandle, kind: TransportEventKind) {
        if self.transport.send(TransportEvent::new(handle, kind)).is_err() {
            trace!(%handle, "Transport event receiver dropped");
        }
    }

    pub fn peer_found(&self, peer: Peer) {
        let _ = self.discovery.send(DiscoveryEvent::PeerFound(peer));
    }
}

/// Consumer side of the radio event channels, owned by the service loop
#[derive(Debug)]
pub struct RadioEvents {
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

pub fn radio_channels() -> (RadioSenders, RadioEvents) {
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
    (
        RadioSenders {
            transport: transport_tx,
            discovery: discovery_tx,
        },
        RadioEvents {
            transport: transport_rx,
            discovery: discovery_rx,
        },
    )
}
