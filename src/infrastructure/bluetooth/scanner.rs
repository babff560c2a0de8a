//! BLE Scanner Module
//!
//! Drives peer discovery and feeds the device registry.

use crate::domain::models::{AppEvent, MessageSeverity, Peer, StatusMessage};
use crate::infrastructure::bluetooth::capability::{Capabilities, Capability};
use crate::infrastructure::bluetooth::registry::{DeviceRegistry, Upsert};
use crate::infrastructure::bluetooth::transport::TransportError;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Advertisement-level events produced by a discovery backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(Peer),
}

/// Platform discovery primitive
pub trait Discovery: Send {
    /// Begin discovery; peers arrive as [`DiscoveryEvent`]s
    fn start_discovery(&mut self) -> Result<(), TransportError>;

    /// Halt discovery. Idempotent.
    fn stop_discovery(&mut self);
}

impl<D: Discovery + ?Sized> Discovery for Box<D> {
    fn start_discovery(&mut self) -> Result<(), TransportError> {
        (**self).start_discovery()
    }

    fn stop_discovery(&mut self) {
        (**self).stop_discovery()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("Bluetooth scan permission not granted")]
    PermissionDenied,
    #[error("Failed to start discovery: {0}")]
    Backend(String),
}

impl From<TransportError> for ScanError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PermissionDenied => ScanError::PermissionDenied,
            TransportError::LinkError(reason) => ScanError::Backend(reason),
        }
    }
}

/// BLE Scanner deduplicating discovered peers by address
pub struct Scanner<D: Discovery> {
    discovery: D,
    registry: DeviceRegistry,
    capabilities: Capabilities,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    name_filter: Option<String>,
    scanning: bool,
}

impl<D: Discovery> Scanner<D> {
    pub fn new(
        discovery: D,
        registry: DeviceRegistry,
        capabilities: Capabilities,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            discovery,
            registry,
            capabilities,
            event_sender,
            name_filter: None,
            scanning: false,
        }
    }

    /// Only report peers whose name contains `filter` (case-insensitive)
    pub fn with_name_filter(mut self, filter: Option<String>) -> Self {
        self.name_filter = filter
            .map(|f| f.to_lowercase())
            .filter(|f| !f.is_empty());
        self
    }

    /// Clear the registry and begin discovery
    pub fn start(&mut self) -> Result<(), ScanError> {
        if !self.capabilities.is_granted(Capability::Scan) {
            debug!("Bluetooth scan permission not granted.");
            return Err(ScanError::PermissionDenied);
        }

        if self.scanning {
            debug!("Cancelling discovery already in progress");
            self.discovery.stop_discovery();
            self.scanning = false;
        }

        self.registry.clear();
        self.discovery.start_discovery()?;
        self.scanning = true;

        info!("Scanning for devices...");
        self.send_log("Scanning for devices...", MessageSeverity::Info);
        Ok(())
    }

    /// Stop scanning. Safe to call when no scan is running.
    pub fn stop(&mut self) {
        if !self.scanning {
            return;
        }
        info!("Stopping BLE scan...");
        self.discovery.stop_discovery();
        self.scanning = false;
        self.send_log("Scan stopped.", MessageSeverity::Info);
    }

    pub fn cancel(&mut self) {
        self.stop();
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn handle_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound(peer) => self.on_peer_found(peer),
        }
    }

    fn on_peer_found(&mut self, peer: Peer) {
        if !self.scanning {
            debug!(address = %peer.address, "Ignoring sighting outside of a scan");
            return;
        }
        if !self.matches_filter(&peer) {
            return;
        }

        match self.registry.upsert(peer.clone()) {
            Upsert::Inserted => {
                info!("Device found: {}", peer);
                let _ = self.event_sender.send(AppEvent::DeviceFound(peer));
            }
            Upsert::Updated => debug!("Device name updated: {}", peer),
            Upsert::Unchanged => {}
        }
    }

    fn matches_filter(&self, peer: &Peer) -> bool {
        match (&self.name_filter, &peer.display_name) {
            (None, _) => true,
            (Some(filter), Some(name)) => name.to_lowercase().contains(filter.as_str()),
            (Some(_), None) => false,
        }
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

impl<D: Discovery> Drop for Scanner<D> {
    fn drop(&mut self) {
        if self.scanning {
            self.discovery.stop_discovery();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::{SimulatedRadio, TransportCall};

    fn scanner(radio: &SimulatedRadio) -> (Scanner<SimulatedRadio>, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scanner = Scanner::new(
            radio.clone(),
            DeviceRegistry::new(),
            Capabilities::granted_all(),
            tx,
        );
        (scanner, rx)
    }

    fn found(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<Peer> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                AppEvent::DeviceFound(peer) => Some(peer),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_device_found_emitted_once_per_address() {
        let (radio, _events) = SimulatedRadio::manual();
        let (mut scanner, mut rx) = scanner(&radio);
        scanner.start().unwrap();

        for name in [None, Some("Nano"), Some("Nano 33")] {
            scanner.handle_event(DiscoveryEvent::PeerFound(Peer::new(
                "AA:BB:CC:DD:EE:FF",
                name.map(str::to_string),
            )));
        }
        scanner.handle_event(DiscoveryEvent::PeerFound(Peer::new("11:22:33:44:55:66", None)));

        let found = found(&mut rx);
        assert_eq!(found.len(), 2);
        assert_eq!(scanner.registry().len(), 2);
        assert_eq!(
            scanner.registry().list()[0].display_name.as_deref(),
            Some("Nano 33")
        );
    }

    #[test]
    fn test_start_clears_registry_and_restarts_discovery() {
        let (radio, _events) = SimulatedRadio::manual();
        let (mut scanner, _rx) = scanner(&radio);

        scanner.start().unwrap();
        scanner.handle_event(DiscoveryEvent::PeerFound(Peer::new("A", None)));
        assert_eq!(scanner.registry().len(), 1);

        scanner.start().unwrap();
        assert!(scanner.registry().is_empty());
        assert_eq!(
            radio.calls(),
            vec![
                TransportCall::StartDiscovery,
                TransportCall::StopDiscovery,
                TransportCall::StartDiscovery
            ]
        );
    }

    #[test]
    fn test_start_without_permission() {
        let (radio, _events) = SimulatedRadio::manual();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scanner = Scanner::new(
            radio.clone(),
            DeviceRegistry::new(),
            Capabilities::new(false, true),
            tx,
        );

        assert_eq!(scanner.start(), Err(ScanError::PermissionDenied));
        assert!(!scanner.is_scanning());
        assert!(radio.calls().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (radio, _events) = SimulatedRadio::manual();
        let (mut scanner, _rx) = scanner(&radio);

        scanner.stop();
        scanner.start().unwrap();
        scanner.stop();
        scanner.cancel();

        assert!(!scanner.is_scanning());
        assert_eq!(
            radio.calls(),
            vec![TransportCall::StartDiscovery, TransportCall::StopDiscovery]
        );
    }

    #[test]
    fn test_name_filter() {
        let (radio, _events) = SimulatedRadio::manual();
        let (scanner, mut rx) = scanner(&radio);
        let mut scanner = scanner.with_name_filter(Some("nano".to_string()));
        scanner.start().unwrap();

        scanner.handle_event(DiscoveryEvent::PeerFound(Peer::new(
            "A",
            Some("Arduino NANO 33".to_string()),
        )));
        scanner.handle_event(DiscoveryEvent::PeerFound(Peer::new("B", None)));
        scanner.handle_event(DiscoveryEvent::PeerFound(Peer::new(
            "C",
            Some("Headphones".to_string()),
        )));

        let found = found(&mut rx);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address.as_str(), "A");
    }
}
