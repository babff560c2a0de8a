//! Radio backend backed by `btleplug` (BlueZ, CoreBluetooth, WinRT).
//!
//! Every trait call returns immediately; the radio work runs on spawned tokio
//! tasks that report back through [`RadioSenders`].

use crate::domain::models::{CharProperties, DiscoveredCharacteristic, Peer, PeerAddress, SessionId};
use crate::infrastructure::bluetooth::protocol::{
    CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::scanner::Discovery;
use crate::infrastructure::bluetooth::transport::{
    GattStatus, LinkHandle, RadioSenders, Transport, TransportError, TransportEventKind,
};
use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic as GattCharacteristic, Descriptor,
    Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status reported when the stack gives no code (Android's GATT_ERROR)
const GATT_ERROR: u16 = 0x0085;

#[derive(Default)]
struct Link {
    peripheral: Option<Peripheral>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn abort(self) -> Option<Peripheral> {
        for task in self.tasks {
            task.abort();
        }
        self.peripheral
    }
}

#[derive(Default)]
struct RadioState {
    scan_task: Option<JoinHandle<()>>,
    links: HashMap<LinkHandle, Link>,
}

/// BLE radio on the first adapter reported by the platform
#[derive(Clone)]
pub struct BtleplugRadio {
    adapter: Adapter,
    senders: RadioSenders,
    runtime: runtime::Handle,
    state: Arc<Mutex<RadioState>>,
}

impl BtleplugRadio {
    /// Must be called from within a tokio runtime
    pub async fn new(senders: RadioSenders) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            adapter,
            senders,
            runtime: runtime::Handle::current(),
            state: Arc::new(Mutex::new(RadioState::default())),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        lock_state(&self.state)
    }

    fn peripheral(&self, handle: LinkHandle) -> Option<Peripheral> {
        self.lock()
            .links
            .get(&handle)
            .and_then(|link| link.peripheral.clone())
    }

    /// Run `op` against the linked peripheral, or report `missing` right away
    fn with_peripheral<F, Fut>(&self, handle: LinkHandle, missing: TransportEventKind, op: F)
    where
        F: FnOnce(Peripheral, RadioSenders) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.peripheral(handle) {
            Some(peripheral) => {
                self.runtime.spawn(op(peripheral, self.senders.clone()));
            }
            None => self.senders.link(handle, missing),
        }
    }
}

fn lock_state(state: &Mutex<RadioState>) -> MutexGuard<'_, RadioState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Stable address for a peripheral. CoreBluetooth hides MAC addresses, so the
/// platform identifier stands in there.
fn peer_address(id: &PeripheralId, properties: &PeripheralProperties) -> String {
    let address = properties.address.to_string();
    if address == "00:00:00:00:00:00" {
        id.to_string()
    } else {
        address
    }
}

fn char_properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<GattCharacteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

async fn scan(adapter: Adapter, senders: RadioSenders) -> Result<()> {
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    debug!("BLE scan started");

    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                debug!("Discovered peripheral vanished: {}", e);
                continue;
            }
        };
        if let Ok(Some(properties)) = peripheral.properties().await {
            let address = peer_address(&id, &properties);
            senders.peer_found(Peer::new(address.as_str(), properties.local_name));
        }
    }
    Ok(())
}

async fn establish(adapter: &Adapter, address: &PeerAddress) -> Result<Peripheral> {
    for peripheral in adapter.peripherals().await? {
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        if peer_address(&peripheral.id(), &properties) != address.as_str() {
            continue;
        }
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        return Ok(peripheral);
    }
    Err(anyhow!("{} is not in range", address))
}

async fn pump_notifications(peripheral: Peripheral, handle: LinkHandle, senders: RadioSenders) {
    let mut notifications = match peripheral.notifications().await {
        Ok(n) => n,
        Err(e) => {
            warn!("Could not get notification stream: {}", e);
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        senders.link(
            handle,
            TransportEventKind::CharacteristicChanged {
                characteristic: notification.uuid,
                value: notification.value,
            },
        );
    }
}

async fn watch_disconnect(
    adapter: Adapter,
    id: PeripheralId,
    handle: LinkHandle,
    senders: RadioSenders,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Could not subscribe to adapter events: {}", e);
            return;
        }
    };
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(gone) = event {
            if gone == id {
                senders.link(handle, TransportEventKind::LinkDown);
                return;
            }
        }
    }
}

impl Discovery for BtleplugRadio {
    fn start_discovery(&mut self) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let senders = self.senders.clone();
        let task = self.runtime.spawn(async move {
            if let Err(e) = scan(adapter, senders).await {
                warn!("BLE scan failed: {}", e);
            }
        });
        if let Some(previous) = self.lock().scan_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_discovery(&mut self) {
        let Some(task) = self.lock().scan_task.take() else {
            return;
        };
        task.abort();
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan cleanly: {}", e);
            }
        });
    }
}

impl Transport for BtleplugRadio {
    fn open(&mut self, peer: &Peer, session: SessionId) -> Result<LinkHandle, TransportError> {
        let handle = LinkHandle::new(session);
        self.lock().links.insert(handle, Link::default());

        let adapter = self.adapter.clone();
        let senders = self.senders.clone();
        let state = self.state.clone();
        let address = peer.address.clone();
        let task = self.runtime.spawn(async move {
            let peripheral = match establish(&adapter, &address).await {
                Ok(p) => p,
                Err(e) => {
                    senders.link(handle, TransportEventKind::LinkFailed(e.to_string()));
                    return;
                }
            };

            let pumps = vec![
                tokio::spawn(pump_notifications(
                    peripheral.clone(),
                    handle,
                    senders.clone(),
                )),
                tokio::spawn(watch_disconnect(
                    adapter.clone(),
                    peripheral.id(),
                    handle,
                    senders.clone(),
                )),
            ];

            let registered = {
                let mut state = lock_state(&state);
                match state.links.get_mut(&handle) {
                    Some(link) => {
                        link.peripheral = Some(peripheral.clone());
                        link.tasks.extend(pumps);
                        true
                    }
                    None => {
                        for pump in pumps {
                            pump.abort();
                        }
                        false
                    }
                }
            };

            if registered {
                senders.link(handle, TransportEventKind::LinkUp);
            } else if let Err(e) = peripheral.disconnect().await {
                debug!("Failed to drop link closed during connect: {}", e);
            }
        });

        match self.lock().links.get_mut(&handle) {
            Some(link) => link.tasks.push(task),
            None => task.abort(),
        }
        Ok(handle)
    }

    fn close(&mut self, handle: LinkHandle) {
        let Some(link) = self.lock().links.remove(&handle) else {
            return;
        };
        if let Some(peripheral) = link.abort() {
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(%handle, "Disconnect failed: {}", e);
                }
            });
        }
    }

    fn discover_services(&mut self, handle: LinkHandle) {
        let missing = TransportEventKind::ServicesDiscovered(Err(GattStatus::Failure(GATT_ERROR)));
        self.with_peripheral(handle, missing, move |peripheral, senders| async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .characteristics()
                    .into_iter()
                    .map(|c| DiscoveredCharacteristic {
                        service_uuid: c.service_uuid,
                        uuid: c.uuid,
                        properties: char_properties(c.properties),
                    })
                    .collect()),
                Err(e) => {
                    warn!("discover_services failed: {}", e);
                    Err(GattStatus::Failure(GATT_ERROR))
                }
            };
            senders.link(handle, TransportEventKind::ServicesDiscovered(result));
        });
    }

    fn write_descriptor(
        &mut self,
        handle: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) {
        let value = value.to_vec();
        let missing = TransportEventKind::DescriptorWritten {
            characteristic,
            descriptor,
            status: GattStatus::Failure(GATT_ERROR),
        };
        self.with_peripheral(handle, missing, move |peripheral, senders| async move {
            let outcome = match find_characteristic(&peripheral, characteristic) {
                None => Err(anyhow!("characteristic {} not found", characteristic)),
                // Platforms manage the CCCD themselves; go through (un)subscribe
                Some(c) if descriptor == CCCD_UUID && value == ENABLE_NOTIFICATION_VALUE => {
                    peripheral.subscribe(&c).await.map_err(Into::into)
                }
                Some(c) if descriptor == CCCD_UUID && value == DISABLE_NOTIFICATION_VALUE => {
                    peripheral.unsubscribe(&c).await.map_err(Into::into)
                }
                Some(c) => {
                    let target = Descriptor {
                        uuid: descriptor,
                        service_uuid: c.service_uuid,
                        characteristic_uuid: c.uuid,
                    };
                    peripheral
                        .write_descriptor(&target, &value)
                        .await
                        .map_err(Into::into)
                }
            };
            let status = match outcome {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!(%characteristic, "Descriptor write failed: {}", e);
                    GattStatus::Failure(GATT_ERROR)
                }
            };
            senders.link(
                handle,
                TransportEventKind::DescriptorWritten {
                    characteristic,
                    descriptor,
                    status,
                },
            );
        });
    }

    fn read_characteristic(&mut self, handle: LinkHandle, characteristic: Uuid) {
        let missing = TransportEventKind::CharacteristicRead {
            characteristic,
            result: Err(GattStatus::Failure(GATT_ERROR)),
        };
        self.with_peripheral(handle, missing, move |peripheral, senders| async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Some(c) => peripheral.read(&c).await.map_err(|e| {
                    warn!(%characteristic, "Read failed: {}", e);
                    GattStatus::Failure(GATT_ERROR)
                }),
                None => Err(GattStatus::Failure(GATT_ERROR)),
            };
            senders.link(
                handle,
                TransportEventKind::CharacteristicRead {
                    characteristic,
                    result,
                },
            );
        });
    }
}
