//! GATT Session State Machine
//!
//! Drives one connection lifecycle:
//!
//! ```text
//! Disconnected → Connecting → Connected → DiscoveringServices → Ready
//!       ▲                                                         │
//!       └──────────────────── Disconnecting ◄─────────────────────┘
//! ```
//!
//! Radio completions arrive through [`GattSession::handle_event`]. Each
//! completion carries the [`LinkHandle`] of the session generation that
//! issued it, so anything addressed to a superseded session is dropped.

use crate::domain::models::{
    AppEvent, Characteristic, DataOrigin, DiscoveredCharacteristic, DispatchedEvent,
    MessageSeverity, NotificationEvent, Peer, SessionId, SessionState, StateChange,
    StatusMessage,
};
use crate::domain::settings::{DiscoveryFailurePolicy, Settings};
use crate::infrastructure::bluetooth::capability::{Capabilities, Capability};
use crate::infrastructure::bluetooth::dispatcher::EventDispatcher;
use crate::infrastructure::bluetooth::processor::{PayloadProcessor, Utf8LogProcessor};
use crate::infrastructure::bluetooth::protocol::{self, CCCD_UUID, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::transport::{
    GattStatus, LinkHandle, Transport, TransportError, TransportEvent, TransportEventKind,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Bluetooth connect permission not granted")]
    PermissionDenied,
    #[error("A session is already active ({0})")]
    AlreadyConnected(SessionState),
    #[error("Link error: {0}")]
    LinkError(String),
    #[error("Service discovery failed: {0}")]
    DiscoveryFailure(GattStatus),
}

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Characteristic read explicitly once discovery completes
    pub target_characteristic: Uuid,
    /// Maximum time spent in `Connecting`
    pub connect_timeout: Duration,
    pub discovery_failure_policy: DiscoveryFailurePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_characteristic: protocol::TARGET_CHAR_UUID,
            connect_timeout: Duration::from_secs(10),
            discovery_failure_policy: DiscoveryFailurePolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            target_characteristic: protocol::parse_uuid(&settings.target_characteristic_uuid)?,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            discovery_failure_policy: settings.discovery_failure_policy,
        })
    }
}

struct ActiveLink {
    peer: Peer,
    handle: LinkHandle,
    characteristics: Vec<Characteristic>,
    connect_deadline: Option<Instant>,
}

/// Client-side GATT session; owns the transport exclusively
pub struct GattSession<T: Transport> {
    transport: T,
    capabilities: Capabilities,
    dispatcher: EventDispatcher,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    processor: Box<dyn PayloadProcessor>,
    config: SessionConfig,
    state: SessionState,
    generation: SessionId,
    link: Option<ActiveLink>,
    last_error: Option<SessionError>,
}

impl<T: Transport> GattSession<T> {
    pub fn new(
        transport: T,
        capabilities: Capabilities,
        dispatcher: EventDispatcher,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            capabilities,
            dispatcher,
            event_sender,
            processor: Box::new(Utf8LogProcessor),
            config,
            state: SessionState::Disconnected,
            generation: SessionId::default(),
            link: None,
            last_error: None,
        }
    }

    pub fn with_processor(mut self, processor: Box<dyn PayloadProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the most recent connection attempt
    pub fn session_id(&self) -> SessionId {
        self.generation
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.link.as_ref().map(|l| &l.peer)
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        self.link
            .as_ref()
            .map(|l| l.characteristics.as_slice())
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Deadline of a pending connection attempt
    pub fn connect_deadline(&self) -> Option<Instant> {
        self.link.as_ref().and_then(|l| l.connect_deadline)
    }

    /// Start connecting to `peer`. Completion arrives as a `LinkUp` event.
    pub fn connect(&mut self, peer: Peer) -> Result<SessionId, SessionError> {
        if self.state.is_active() {
            return Err(SessionError::AlreadyConnected(self.state));
        }
        if !self.capabilities.is_granted(Capability::Connect) {
            debug!("Bluetooth connect permission not granted.");
            return Err(SessionError::PermissionDenied);
        }

        self.generation = self.generation.next();
        self.last_error = None;
        let session = self.generation;
        info!(%session, "Connecting to {}", peer);
        self.transition(SessionState::Connecting);

        match self.transport.open(&peer, session) {
            Ok(handle) => {
                self.link = Some(ActiveLink {
                    peer,
                    handle,
                    characteristics: Vec::new(),
                    connect_deadline: Some(Instant::now() + self.config.connect_timeout),
                });
                self.send_log("Connecting to device...", MessageSeverity::Info);
                Ok(session)
            }
            Err(e) => {
                let err = match e {
                    TransportError::PermissionDenied => SessionError::PermissionDenied,
                    TransportError::LinkError(reason) => SessionError::LinkError(reason),
                };
                warn!(%session, "Failed to open link: {}", err);
                self.fail(err.clone());
                self.transition(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Tear the session down. Always ends in `Disconnected`; a no-op when
    /// already disconnected.
    pub fn disconnect(&mut self) {
        if !self.state.is_active() {
            debug!("Disconnect requested while already disconnected");
            return;
        }

        self.transition(SessionState::Disconnecting);
        self.release_link();
        self.transition(SessionState::Disconnected);

        info!("Disconnected from device");
        self.send_log("Disconnected from device", MessageSeverity::Info);
    }

    /// Abandon a connection attempt that has outlived its deadline.
    /// Returns `true` if the attempt was abandoned.
    pub fn check_connect_timeout(&mut self, now: Instant) -> bool {
        match self.connect_deadline() {
            Some(deadline) if self.state == SessionState::Connecting && now >= deadline => {
                warn!(session = %self.generation, "Connection attempt timed out");
                self.fail(SessionError::LinkError(format!(
                    "connection timed out after {:?}",
                    self.config.connect_timeout
                )));
                self.release_link();
                self.transition(SessionState::Disconnected);
                true
            }
            _ => false,
        }
    }

    /// Apply one radio completion
    pub fn handle_event(&mut self, event: TransportEvent) {
        let Some(link) = self.link.as_ref() else {
            trace!(handle = %event.handle, "Discarding event with no active session");
            return;
        };
        if event.handle != link.handle {
            debug!(
                handle = %event.handle,
                current = %link.handle,
                "Discarding completion addressed to a superseded session"
            );
            return;
        }
        let handle = link.handle;

        match event.kind {
            TransportEventKind::LinkUp => self.on_link_up(handle),
            TransportEventKind::LinkFailed(reason) => {
                if self.state == SessionState::Connecting {
                    warn!("Failed to connect: {}", reason);
                    self.fail(SessionError::LinkError(reason));
                    self.release_link();
                    self.transition(SessionState::Disconnected);
                }
            }
            TransportEventKind::LinkDown => {
                info!("Disconnected from GATT server.");
                self.release_link();
                self.transition(SessionState::Disconnected);
            }
            TransportEventKind::ServicesDiscovered(result) => {
                self.on_services_discovered(handle, result)
            }
            TransportEventKind::DescriptorWritten {
                characteristic,
                descriptor,
                status,
            } => {
                if status.is_success() {
                    debug!(%characteristic, %descriptor, "Descriptor written");
                } else {
                    warn!(%characteristic, %descriptor, "Descriptor write failed: {}", status);
                }
            }
            TransportEventKind::CharacteristicRead {
                characteristic,
                result,
            } => match result {
                Ok(value) => self.on_data(characteristic, value, DataOrigin::Read),
                Err(status) => warn!(%characteristic, "Characteristic read failed: {}", status),
            },
            TransportEventKind::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_data(characteristic, value, DataOrigin::Notify),
        }
    }

    fn on_link_up(&mut self, handle: LinkHandle) {
        if self.state != SessionState::Connecting {
            debug!(state = %self.state, "Ignoring duplicate link-up");
            return;
        }
        if let Some(link) = self.link.as_mut() {
            link.connect_deadline = None;
        }

        info!("Connected to GATT server.");
        self.transition(SessionState::Connected);
        let _ = self.event_sender.send(AppEvent::LogMessage(
            StatusMessage::new(
                "Connection established, data logging running",
                MessageSeverity::Success,
            )
            .with_title("Bluetooth Connected"),
        ));

        self.transition(SessionState::DiscoveringServices);
        self.transport.discover_services(handle);
    }

    fn on_services_discovered(
        &mut self,
        handle: LinkHandle,
        result: Result<Vec<DiscoveredCharacteristic>, GattStatus>,
    ) {
        if self.state != SessionState::DiscoveringServices {
            debug!(state = %self.state, "Ignoring discovery result outside of discovery");
            return;
        }

        let discovered = match result {
            Ok(discovered) => discovered,
            Err(status) => {
                error!("Service discovery failed: {}", status);
                self.fail(SessionError::DiscoveryFailure(status));
                if self.config.discovery_failure_policy == DiscoveryFailurePolicy::Disconnect {
                    self.release_link();
                    self.transition(SessionState::Disconnected);
                }
                return;
            }
        };

        let target = self.config.target_characteristic;
        let characteristics: Vec<Characteristic> = discovered
            .iter()
            .map(|raw| Characteristic::from_discovered(raw, target))
            .collect();
        info!("Found {} characteristics", characteristics.len());

        for c in &characteristics {
            if c.supports_notify {
                debug!(characteristic = %c.uuid, "Enabling notifications");
                self.transport
                    .write_descriptor(handle, c.uuid, CCCD_UUID, &ENABLE_NOTIFICATION_VALUE);
            }
            if c.is_target_channel {
                debug!(characteristic = %c.uuid, "Reading target characteristic");
                self.transport.read_characteristic(handle, c.uuid);
            }
        }

        if let Some(link) = self.link.as_mut() {
            link.characteristics = characteristics;
        }
        self.transition(SessionState::Ready);
    }

    fn on_data(&mut self, characteristic: Uuid, value: Vec<u8>, origin: DataOrigin) {
        if self.state != SessionState::Ready {
            trace!(%characteristic, state = %self.state, "Dropping data received before ready");
            return;
        }
        let accepted = self
            .characteristics()
            .iter()
            .any(|c| c.uuid == characteristic && (c.supports_notify || c.is_target_channel));
        if !accepted {
            debug!(%characteristic, "Dropping data from an unsubscribed characteristic");
            return;
        }

        debug!(
            %characteristic,
            "Data received: {}",
            protocol::decode_text(&value)
        );
        let event = NotificationEvent::new(characteristic, value, origin);
        self.processor.process(&event);
        let _ = self
            .event_sender
            .send(AppEvent::DataReceived(event.payload.clone()));
        self.dispatcher.push(DispatchedEvent::Notification(event));
    }

    /// Close the transport handle, if any. Best effort; never fails.
    fn release_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        if self.capabilities.is_granted(Capability::Connect) {
            self.transport.close(link.handle);
        } else {
            debug!("Bluetooth disconnect permission not granted.");
        }
    }

    fn fail(&mut self, err: SessionError) {
        self.send_log(&err.to_string(), MessageSeverity::Error);
        self.last_error = Some(err);
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(session = %self.generation, %from, %to, "Session state changed");
        self.dispatcher
            .push(DispatchedEvent::StateChanged(StateChange {
                session: self.generation,
                from,
                to,
            }));
        let _ = self.event_sender.send(AppEvent::ConnectionStatus(to));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

impl<T: Transport> Drop for GattSession<T> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            self.transport.close(link.handle);
        }
    }
}
