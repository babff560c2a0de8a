//! Device Registry
//!
//! Discovered peers keyed by address, in discovery order.

use crate::domain::models::{Peer, PeerAddress};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RegistryInner {
    peers: Vec<Peer>,
    index: HashMap<PeerAddress, usize>,
}

/// Outcome of recording a discovered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a peer. A known address keeps its position; a newer non-empty
    /// name replaces the stored one.
    pub fn upsert(&self, peer: Peer) -> Upsert {
        let mut inner = self.lock();
        if let Some(&i) = inner.index.get(&peer.address) {
            let existing = &mut inner.peers[i];
            if peer.display_name.is_some() && existing.display_name != peer.display_name {
                existing.display_name = peer.display_name;
                return Upsert::Updated;
            }
            return Upsert::Unchanged;
        }

        let i = inner.peers.len();
        inner.index.insert(peer.address.clone(), i);
        inner.peers.push(peer);
        Upsert::Inserted
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.peers.clear();
        inner.index.clear();
    }

    /// Snapshot of all peers in discovery order
    pub fn list(&self) -> Vec<Peer> {
        self.lock().peers.clone()
    }

    pub fn get(&self, address: &PeerAddress) -> Option<Peer> {
        let inner = self.lock();
        inner.index.get(address).map(|&i| inner.peers[i].clone())
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
