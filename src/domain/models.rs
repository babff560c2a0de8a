use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Opaque, stable identifier of a remote device (MAC-like on most platforms).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A discovered remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: PeerAddress,
    pub display_name: Option<String>,
}

impl Peer {
    pub fn new(address: impl Into<PeerAddress>, display_name: Option<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.filter(|n| !n.is_empty()),
        }
    }

    /// Name shown in device lists
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unknown")
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.label(), self.address)
    }
}

/// Generation number identifying one connection lifecycle.
///
/// Every `connect` mints a new id; completions tagged with an older id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    Disconnecting,
}

impl SessionState {
    /// Whether a session in this state still owns a transport handle
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::DiscoveringServices => "discovering services",
            SessionState::Ready => "ready",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// GATT characteristic property bits as reported by service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub const NONE: Self = Self {
        read: false,
        write: false,
        write_without_response: false,
        notify: false,
        indicate: false,
    };

    pub fn read_notify() -> Self {
        Self {
            read: true,
            notify: true,
            ..Self::NONE
        }
    }
}

/// Raw characteristic record produced by the transport during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
}

/// Session-side view of a discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    pub supports_notify: bool,
    pub is_target_channel: bool,
}

impl Characteristic {
    pub fn from_discovered(raw: &DiscoveredCharacteristic, target: Uuid) -> Self {
        Self {
            service_uuid: raw.service_uuid,
            uuid: raw.uuid,
            supports_notify: raw.properties.notify,
            is_target_channel: raw.uuid == target,
        }
    }
}

/// How a data record reached the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    /// Peer-initiated value change
    Notify,
    /// Completion of an explicit characteristic read
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub characteristic_uuid: Uuid,
    pub payload: Vec<u8>,
    pub timestamp: SystemTime,
    pub origin: DataOrigin,
}

impl NotificationEvent {
    pub fn new(characteristic_uuid: Uuid, payload: Vec<u8>, origin: DataOrigin) -> Self {
        Self {
            characteristic_uuid,
            payload,
            timestamp: SystemTime::now(),
            origin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub session: SessionId,
    pub from: SessionState,
    pub to: SessionState,
}

/// Record delivered through the event dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchedEvent {
    Notification(NotificationEvent),
    StateChanged(StateChange),
}

impl DispatchedEvent {
    pub fn as_notification(&self) -> Option<&NotificationEvent> {
        match self {
            DispatchedEvent::Notification(event) => Some(event),
            DispatchedEvent::StateChanged(_) => None,
        }
    }
}

/// Events for the UI / notifier collaborator
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(Peer),
    ConnectionStatus(SessionState),
    DataReceived(Vec<u8>),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub title: Option<String>,
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            title: None,
            message: message.into(),
            severity,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
