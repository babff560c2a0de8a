//! In-memory radio
//!
//! Stands in for the platform radio in headless runs and tests. In
//! auto-respond mode it answers every operation the way a well-behaved
//! sensor node would; in manual mode it only records calls and the caller
//! injects completions through the same handle.

use crate::domain::models::{
    CharProperties, DiscoveredCharacteristic, Peer, PeerAddress, SessionId,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::Discovery;
use crate::infrastructure::bluetooth::transport::{
    radio_channels, GattStatus, LinkHandle, RadioEvents, RadioSenders, Transport, TransportError,
    TransportEventKind,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Data-logging service exposed by the simulated sensor node
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);

/// One operation requested from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartDiscovery,
    StopDiscovery,
    Open {
        address: PeerAddress,
        session: SessionId,
    },
    Close(LinkHandle),
    DiscoverServices(LinkHandle),
    WriteDescriptor {
        handle: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    ReadCharacteristic {
        handle: LinkHandle,
        characteristic: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub peer: Peer,
    pub characteristics: Vec<DiscoveredCharacteristic>,
    pub read_values: HashMap<Uuid, Vec<u8>>,
}

impl SimulatedPeripheral {
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            characteristics: Vec::new(),
            read_values: HashMap::new(),
        }
    }

    /// Arduino-style node with one notifying data characteristic
    pub fn sensor_node(peer: Peer) -> Self {
        Self::new(peer)
            .with_characteristic(protocol::TARGET_CHAR_UUID, CharProperties::read_notify())
            .with_read_value(protocol::TARGET_CHAR_UUID, b"0.0,0".to_vec())
    }

    pub fn with_characteristic(mut self, uuid: Uuid, properties: CharProperties) -> Self {
        self.characteristics.push(DiscoveredCharacteristic {
            service_uuid: SENSOR_SERVICE_UUID,
            uuid,
            properties,
        });
        self
    }

    pub fn with_read_value(mut self, uuid: Uuid, value: Vec<u8>) -> Self {
        self.read_values.insert(uuid, value);
        self
    }
}

#[derive(Debug, Default)]
struct SimState {
    peripherals: Vec<SimulatedPeripheral>,
    calls: Vec<TransportCall>,
    links: HashMap<LinkHandle, PeerAddress>,
    open_error: Option<TransportError>,
    discovery_failure: Option<GattStatus>,
}

impl SimState {
    fn peripheral(&self, address: &PeerAddress) -> Option<&SimulatedPeripheral> {
        self.peripherals.iter().find(|p| &p.peer.address == address)
    }

    fn linked_peripheral(&self, handle: LinkHandle) -> Option<&SimulatedPeripheral> {
        self.links
            .get(&handle)
            .and_then(|address| self.peripheral(address))
    }
}

/// Cloneable handle to one simulated radio; all clones share state
#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
    senders: RadioSenders,
    auto_respond: bool,
}

impl SimulatedRadio {
    fn build(auto_respond: bool) -> (Self, RadioEvents) {
        let (senders, events) = radio_channels();
        let radio = Self {
            state: Arc::new(Mutex::new(SimState::default())),
            senders,
            auto_respond,
        };
        (radio, events)
    }

    /// Radio answering every request on its own
    pub fn auto() -> (Self, RadioEvents) {
        Self::build(true)
    }

    /// Radio that only records requests
    pub fn manual() -> (Self, RadioEvents) {
        Self::build(false)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.lock().peripherals.push(peripheral);
    }

    /// Make the next `open` calls fail synchronously
    pub fn set_open_error(&self, error: Option<TransportError>) {
        self.lock().open_error = error;
    }

    /// Make automatic service discovery report `status`
    pub fn set_discovery_failure(&self, status: Option<GattStatus>) {
        self.lock().discovery_failure = status;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn descriptor_writes(&self) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::WriteDescriptor { .. }))
            .collect()
    }

    pub fn reads(&self) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::ReadCharacteristic { characteristic, .. } => Some(characteristic),
                _ => None,
            })
            .collect()
    }

    pub fn active_links(&self) -> Vec<LinkHandle> {
        self.lock().links.keys().copied().collect()
    }

    /// Report a peer as if it had just been seen over the air
    pub fn advertise(&self, peer: Peer) {
        self.senders.peer_found(peer);
    }

    pub fn emit(&self, handle: LinkHandle, kind: TransportEventKind) {
        self.senders.link(handle, kind);
    }

    /// Peer-initiated value change
    pub fn notify(&self, handle: LinkHandle, characteristic: Uuid, value: impl Into<Vec<u8>>) {
        self.emit(
            handle,
            TransportEventKind::CharacteristicChanged {
                characteristic,
                value: value.into(),
            },
        );
    }

    /// Drop the link from the peer side
    pub fn drop_link(&self, handle: LinkHandle) {
        self.lock().links.remove(&handle);
        self.emit(handle, TransportEventKind::LinkDown);
    }

    fn record(&self, call: TransportCall) -> MutexGuard<'_, SimState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }
}

impl Discovery for SimulatedRadio {
    fn start_discovery(&mut self) -> Result<(), TransportError> {
        let peers: Vec<Peer> = {
            let state = self.record(TransportCall::StartDiscovery);
            state.peripherals.iter().map(|p| p.peer.clone()).collect()
        };
        if self.auto_respond {
            for peer in peers {
                self.advertise(peer);
            }
        }
        Ok(())
    }

    fn stop_discovery(&mut self) {
        self.record(TransportCall::StopDiscovery);
    }
}

impl Transport for SimulatedRadio {
    fn open(&mut self, peer: &Peer, session: SessionId) -> Result<LinkHandle, TransportError> {
        let handle = LinkHandle::new(session);
        let known = {
            let mut state = self.record(TransportCall::Open {
                address: peer.address.clone(),
                session,
            });
            if let Some(error) = state.open_error.clone() {
                return Err(error);
            }
            state.links.insert(handle, peer.address.clone());
            state.peripheral(&peer.address).is_some()
        };

        if self.auto_respond {
            if known {
                self.emit(handle, TransportEventKind::LinkUp);
            } else {
                self.lock().links.remove(&handle);
                self.emit(
                    handle,
                    TransportEventKind::LinkFailed(format!("{} is out of range", peer.address)),
                );
            }
        }
        Ok(handle)
    }

    fn close(&mut self, handle: LinkHandle) {
        let was_open = self
            .record(TransportCall::Close(handle))
            .links
            .remove(&handle)
            .is_some();
        if was_open {
            debug!(%handle, "Simulated link closed");
            if self.auto_respond {
                self.emit(handle, TransportEventKind::LinkDown);
            }
        }
    }

    fn discover_services(&mut self, handle: LinkHandle) {
        let result = {
            let state = self.record(TransportCall::DiscoverServices(handle));
            match (state.discovery_failure, state.linked_peripheral(handle)) {
                (Some(status), _) => Err(status),
                (None, Some(p)) => Ok(p.characteristics.clone()),
                (None, None) => Err(GattStatus::Failure(0x0085)),
            }
        };
        if self.auto_respond {
            self.emit(handle, TransportEventKind::ServicesDiscovered(result));
        }
    }

    fn write_descriptor(
        &mut self,
        handle: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) {
        self.record(TransportCall::WriteDescriptor {
            handle,
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        if self.auto_respond {
            self.emit(
                handle,
                TransportEventKind::DescriptorWritten {
                    characteristic,
                    descriptor,
                    status: GattStatus::Success,
                },
            );
        }
    }

    fn read_characteristic(&mut self, handle: LinkHandle, characteristic: Uuid) {
        let value = {
            let state = self.record(TransportCall::ReadCharacteristic {
                handle,
                characteristic,
            });
            state
                .linked_peripheral(handle)
                .and_then(|p| p.read_values.get(&characteristic).cloned())
        };
        if self.auto_respond {
            self.emit(
                handle,
                TransportEventKind::CharacteristicRead {
                    characteristic,
                    result: value.ok_or(GattStatus::Failure(0x0002)),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_radio_answers_open_and_discovery() {
        let (mut radio, mut events) = SimulatedRadio::auto();
        let peer = Peer::new("AA:BB:CC:DD:EE:FF", None);
        radio.add_peripheral(SimulatedPeripheral::sensor_node(peer.clone()));

        let handle = radio.open(&peer, SessionId(1)).unwrap();
        radio.discover_services(handle);

        let up = events.transport.try_recv().unwrap();
        assert_eq!(up.kind, TransportEventKind::LinkUp);
        match events.transport.try_recv().unwrap().kind {
            TransportEventKind::ServicesDiscovered(Ok(chars)) => {
                assert_eq!(chars.len(), 1);
                assert_eq!(chars[0].uuid, protocol::TARGET_CHAR_UUID);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_peer_fails_link() {
        let (mut radio, mut events) = SimulatedRadio::auto();
        let handle = radio
            .open(&Peer::new("00:00:00:00:00:00", None), SessionId(3))
            .unwrap();

        assert!(matches!(
            events.transport.try_recv().unwrap().kind,
            TransportEventKind::LinkFailed(_)
        ));
        assert!(!radio.active_links().contains(&handle));
    }

    #[test]
    fn test_manual_radio_only_records() {
        let (mut radio, mut events) = SimulatedRadio::manual();
        let peer = Peer::new("AA:BB:CC:DD:EE:FF", None);
        radio.add_peripheral(SimulatedPeripheral::sensor_node(peer.clone()));

        let handle = radio.open(&peer, SessionId(1)).unwrap();
        radio.read_characteristic(handle, protocol::TARGET_CHAR_UUID);
        radio.close(handle);
        radio.close(handle);

        assert!(events.transport.try_recv().is_err());
        assert_eq!(radio.reads(), vec![protocol::TARGET_CHAR_UUID]);
        assert_eq!(radio.calls().len(), 4);
    }
}
