//! Bluetooth Service Module
//!
//! Single owner of the scanner and the GATT session. Collaborator commands
//! arrive through a [`ServiceHandle`]; radio completions arrive through the
//! backend's event channels. Both are serialised on one task so session state
//! is never touched concurrently.

use crate::domain::models::{AppEvent, Peer, PeerAddress, SessionId, SessionState};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::capability::Capabilities;
use crate::infrastructure::bluetooth::dispatcher::EventDispatcher;
use crate::infrastructure::bluetooth::processor::PayloadProcessor;
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::scanner::{Discovery, ScanError, Scanner};
use crate::infrastructure::bluetooth::session::{GattSession, SessionConfig, SessionError};
use crate::infrastructure::bluetooth::transport::{RadioEvents, Transport};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("Unknown device {0}")]
    UnknownDevice(PeerAddress),
    #[error("Bluetooth service has stopped")]
    Stopped,
}

/// Configuration for the coordinator
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub session: SessionConfig,
    pub dispatcher_capacity: Option<usize>,
    pub device_name_filter: Option<String>,
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            session: SessionConfig::from_settings(settings)?,
            dispatcher_capacity: settings.dispatcher_capacity,
            device_name_filter: settings.device_name_filter.clone(),
        })
    }
}

#[derive(Debug)]
enum ServiceCommand {
    StartScan(oneshot::Sender<Result<(), ServiceError>>),
    StopScan,
    SelectDevice(PeerAddress, oneshot::Sender<Result<SessionId, ServiceError>>),
    Connect(Peer, oneshot::Sender<Result<SessionId, ServiceError>>),
    Disconnect(oneshot::Sender<()>),
    State(oneshot::Sender<SessionState>),
    Shutdown,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<T: Transport, D: Discovery> {
    session: GattSession<T>,
    scanner: Scanner<D>,
    dispatcher: EventDispatcher,
    radio_events: RadioEvents,
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
}

impl<T, D> BluetoothService<T, D>
where
    T: Transport + 'static,
    D: Discovery + 'static,
{
    /// Create a new Bluetooth service and the handle used to drive it
    pub fn new(
        transport: T,
        discovery: D,
        radio_events: RadioEvents,
        capabilities: Capabilities,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ServiceConfig,
    ) -> (Self, ServiceHandle) {
        let registry = DeviceRegistry::new();
        let dispatcher = EventDispatcher::with_capacity(config.dispatcher_capacity);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let scanner = Scanner::new(
            discovery,
            registry.clone(),
            capabilities.clone(),
            event_sender.clone(),
        )
        .with_name_filter(config.device_name_filter);
        let session = GattSession::new(
            transport,
            capabilities,
            dispatcher.clone(),
            event_sender,
            config.session,
        );

        let handle = ServiceHandle {
            commands: command_tx,
            registry,
            dispatcher: dispatcher.clone(),
        };
        let service = Self {
            session,
            scanner,
            dispatcher,
            radio_events,
            commands: command_rx,
        };
        (service, handle)
    }

    pub fn with_processor(mut self, processor: Box<dyn PayloadProcessor>) -> Self {
        self.session = self.session.with_processor(processor);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands and radio events until shutdown
    pub async fn run(mut self) {
        info!("Bluetooth service started");
        loop {
            let deadline = self.session.connect_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ServiceCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.radio_events.transport.recv() => {
                    self.session.handle_event(event);
                }
                Some(event) = self.radio_events.discovery.recv() => {
                    self.scanner.handle_event(event);
                }
                _ = wait_until(deadline) => {
                    self.session.check_connect_timeout(Instant::now());
                }
            }
        }

        info!("Bluetooth service stopping");
        self.scanner.stop();
        self.session.disconnect();
        self.dispatcher.close();
    }

    fn handle_command(&mut self, command: ServiceCommand) {
        debug!(?command, "Handling command");
        match command {
            ServiceCommand::StartScan(reply) => {
                let _ = reply.send(self.scanner.start().map_err(ServiceError::from));
            }
            ServiceCommand::StopScan => self.scanner.stop(),
            ServiceCommand::SelectDevice(address, reply) => {
                let result = match self.scanner.registry().get(&address) {
                    Some(peer) => self.connect(peer),
                    None => Err(ServiceError::UnknownDevice(address)),
                };
                let _ = reply.send(result);
            }
            ServiceCommand::Connect(peer, reply) => {
                let _ = reply.send(self.connect(peer));
            }
            ServiceCommand::Disconnect(reply) => {
                self.session.disconnect();
                let _ = reply.send(());
            }
            ServiceCommand::State(reply) => {
                let _ = reply.send(self.session.state());
            }
            ServiceCommand::Shutdown => {}
        }
    }

    fn connect(&mut self, peer: Peer) -> Result<SessionId, ServiceError> {
        let session = self.session.connect(peer)?;
        // Discovery competes with the link for radio time
        self.scanner.stop();
        Ok(session)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable front end used by the UI / collaborator
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<ServiceCommand>,
    registry: DeviceRegistry,
    dispatcher: EventDispatcher,
}

impl ServiceHandle {
    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> ServiceCommand,
    ) -> Result<R, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn start_scan(&self) -> Result<(), ServiceError> {
        self.request(ServiceCommand::StartScan).await?
    }

    pub fn stop_scan(&self) {
        let _ = self.commands.send(ServiceCommand::StopScan);
    }

    /// Connect to a peer previously reported by the scanner
    pub async fn select_device(&self, address: PeerAddress) -> Result<SessionId, ServiceError> {
        self.request(|tx| ServiceCommand::SelectDevice(address, tx))
            .await?
    }

    pub async fn connect(&self, peer: Peer) -> Result<SessionId, ServiceError> {
        self.request(|tx| ServiceCommand::Connect(peer, tx)).await?
    }

    pub async fn disconnect(&self) -> Result<(), ServiceError> {
        self.request(ServiceCommand::Disconnect).await
    }

    pub async fn state(&self) -> Result<SessionState, ServiceError> {
        self.request(ServiceCommand::State).await
    }

    /// Stop the service loop; the session is disconnected on the way out
    pub fn shutdown(&self) {
        let _ = self.commands.send(ServiceCommand::Shutdown);
    }

    /// Discovered peers in discovery order
    pub fn devices(&self) -> Vec<Peer> {
        self.registry.list()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DataOrigin, DispatchedEvent, NotificationEvent};
    use crate::infrastructure::bluetooth::protocol::{self, CCCD_UUID};
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedPeripheral, SimulatedRadio, TransportCall,
    };
    use crate::infrastructure::bluetooth::transport::{GattStatus, LinkHandle};
    use std::time::Duration;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn start(
        radio: &SimulatedRadio,
        events: RadioEvents,
        config: ServiceConfig,
    ) -> (
        ServiceHandle,
        mpsc::UnboundedReceiver<AppEvent>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (service, handle) = BluetoothService::new(
            radio.clone(),
            radio.clone(),
            events,
            Capabilities::granted_all(),
            tx,
            config,
        );
        (handle, rx, service.spawn())
    }

    async fn wait_for_state(handle: &ServiceHandle, target: SessionState) -> Vec<DispatchedEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), handle.dispatcher().next())
                .await
                .expect("timed out waiting for state")
                .expect("dispatcher closed");
            let reached = matches!(&event, DispatchedEvent::StateChanged(c) if c.to == target);
            seen.push(event);
            if reached {
                return seen;
            }
        }
    }

    async fn next_notification(handle: &ServiceHandle) -> NotificationEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), handle.dispatcher().next())
                .await
                .expect("timed out waiting for data")
                .expect("dispatcher closed");
            if let DispatchedEvent::Notification(n) = event {
                return n;
            }
        }
    }

    async fn wait_for_device(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Peer {
        loop {
            match rx.recv().await.expect("event channel closed") {
                AppEvent::DeviceFound(peer) => return peer,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_scan_connect_and_receive() {
        let (radio, events) = SimulatedRadio::auto();
        radio.add_peripheral(SimulatedPeripheral::sensor_node(Peer::new(
            ADDRESS,
            Some("Nano 33 BLE".to_string()),
        )));
        let (handle, mut app_events, task) = start(&radio, events, ServiceConfig::default());

        handle.start_scan().await.unwrap();
        let peer = wait_for_device(&mut app_events).await;
        assert_eq!(peer.address.as_str(), ADDRESS);
        assert_eq!(handle.devices(), vec![peer.clone()]);

        let session = handle.select_device(peer.address.clone()).await.unwrap();
        let states: Vec<SessionState> = wait_for_state(&handle, SessionState::Ready)
            .await
            .into_iter()
            .filter_map(|e| match e {
                DispatchedEvent::StateChanged(c) => Some(c.to),
                DispatchedEvent::Notification(_) => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::DiscoveringServices,
                SessionState::Ready,
            ]
        );

        let link = LinkHandle::new(session);
        assert_eq!(
            radio.descriptor_writes(),
            vec![TransportCall::WriteDescriptor {
                handle: link,
                characteristic: protocol::TARGET_CHAR_UUID,
                descriptor: CCCD_UUID,
                value: vec![0x01, 0x00],
            }]
        );
        assert_eq!(radio.reads(), vec![protocol::TARGET_CHAR_UUID]);

        let initial = next_notification(&handle).await;
        assert_eq!(initial.origin, DataOrigin::Read);

        radio.notify(link, protocol::TARGET_CHAR_UUID, b"23.5,60".to_vec());
        radio.notify(link, protocol::TARGET_CHAR_UUID, b"23.6,61".to_vec());
        let first = next_notification(&handle).await;
        let second = next_notification(&handle).await;
        assert_eq!(first.payload, b"23.5,60".to_vec());
        assert_eq!(first.characteristic_uuid, protocol::TARGET_CHAR_UUID);
        assert_eq!(first.origin, DataOrigin::Notify);
        assert_eq!(second.payload, b"23.6,61".to_vec());

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(radio.active_links(), Vec::<LinkHandle>::new());
    }

    #[tokio::test]
    async fn test_select_unknown_device() {
        let (radio, events) = SimulatedRadio::auto();
        let (handle, _rx, _task) = start(&radio, events, ServiceConfig::default());

        let result = handle.select_device(PeerAddress::from(ADDRESS)).await;
        assert_eq!(
            result,
            Err(ServiceError::UnknownDevice(PeerAddress::from(ADDRESS)))
        );
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let (radio, events) = SimulatedRadio::manual();
        let (handle, _rx, _task) = start(&radio, events, ServiceConfig::default());
        let peer = Peer::new(ADDRESS, None);

        handle.connect(peer.clone()).await.unwrap();
        assert_eq!(
            handle.connect(peer).await,
            Err(ServiceError::Session(SessionError::AlreadyConnected(
                SessionState::Connecting
            )))
        );

        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_connect_keeps_scan_running() {
        let (radio, events) = SimulatedRadio::manual();
        let (handle, _rx, _task) = start(&radio, events, ServiceConfig::default());

        handle.connect(Peer::new(ADDRESS, None)).await.unwrap();
        handle.start_scan().await.unwrap();
        radio.clear_calls();

        let second = handle.connect(Peer::new("11:22:33:44:55:66", None)).await;
        assert_eq!(
            second,
            Err(ServiceError::Session(SessionError::AlreadyConnected(
                SessionState::Connecting
            )))
        );
        assert!(radio.calls().is_empty());
        assert_eq!(handle.state().await.unwrap(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_discovery_failure_returns_to_disconnected() {
        let (radio, events) = SimulatedRadio::auto();
        let peer = Peer::new(ADDRESS, None);
        radio.add_peripheral(SimulatedPeripheral::sensor_node(peer.clone()));
        radio.set_discovery_failure(Some(GattStatus::Failure(0x0101)));
        let (handle, _rx, _task) = start(&radio, events, ServiceConfig::default());

        handle.connect(peer).await.unwrap();
        let states: Vec<SessionState> = wait_for_state(&handle, SessionState::Disconnected)
            .await
            .into_iter()
            .filter_map(|e| match e {
                DispatchedEvent::StateChanged(c) => Some(c.to),
                DispatchedEvent::Notification(_) => None,
            })
            .collect();

        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::DiscoveringServices,
                SessionState::Disconnected,
            ]
        );
        assert!(radio.descriptor_writes().is_empty());
        assert!(radio.active_links().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let (radio, events) = SimulatedRadio::manual();
        let config = ServiceConfig {
            session: SessionConfig {
                connect_timeout: Duration::from_secs(3),
                ..SessionConfig::default()
            },
            ..ServiceConfig::default()
        };
        let (handle, _rx, _task) = start(&radio, events, config);

        handle.connect(Peer::new(ADDRESS, None)).await.unwrap();
        wait_for_state(&handle, SessionState::Disconnected).await;

        assert_eq!(handle.state().await.unwrap(), SessionState::Disconnected);
        assert!(radio
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Close(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_dispatcher() {
        let (radio, events) = SimulatedRadio::auto();
        let (handle, _rx, task) = start(&radio, events, ServiceConfig::default());

        handle.shutdown();
        task.await.unwrap();

        assert!(handle.dispatcher().is_closed());
        assert!(handle.dispatcher().next().await.is_none());
        assert_eq!(handle.state().await, Err(ServiceError::Stopped));
    }

    #[test]
    fn test_service_config_from_settings() {
        let settings = Settings {
            dispatcher_capacity: Some(64),
            device_name_filter: Some("nano".to_string()),
            ..Settings::default()
        };
        let config = ServiceConfig::from_settings(&settings).unwrap();
        assert_eq!(config.dispatcher_capacity, Some(64));
        assert_eq!(config.device_name_filter.as_deref(), Some("nano"));
    }
}
