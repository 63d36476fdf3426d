//! Peer registry: tracks known peers, their addresses and reachability.
//!
//! The [`PeerRegistry`] is a thread-safe table shared by the TCP peer host
//! and anything that needs to enumerate peers (the mesher, status reports).

use chrono::{DateTime, Utc};
use peerlink_types::{PeerAddr, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Addresses are known but no stream has been completed yet.
    Known,
    /// At least one handshake completed and the last dial succeeded.
    Connected,
    /// The last dial failed (eligible for reconnect).
    Disconnected,
}

/// An entry representing a single known peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub id: PeerId,
    /// Dialable addresses, most recently learned first.
    pub addrs: Vec<SocketAddr>,
    pub state: PeerState,
    /// When the peer first completed a handshake.
    pub connected_at: Option<DateTime<Utc>>,
    /// Last successful handshake in either direction.
    pub last_seen: DateTime<Utc>,
}

impl PeerEntry {
    pub fn addr_info(&self) -> PeerAddr {
        PeerAddr::new(self.id.clone(), self.addrs.clone())
    }
}

/// Thread-safe registry of all known peers.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerId, PeerEntry>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record addresses for a peer, creating it in the `Known` state if new.
    /// New addresses are moved to the front; existing ones keep their state.
    pub fn add_addrs(&self, id: &PeerId, addrs: &[SocketAddr]) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let entry = peers.entry(id.clone()).or_insert_with(|| PeerEntry {
            id: id.clone(),
            addrs: Vec::new(),
            state: PeerState::Known,
            connected_at: None,
            last_seen: Utc::now(),
        });
        for addr in addrs.iter().rev() {
            entry.addrs.retain(|a| a != addr);
            entry.addrs.insert(0, *addr);
        }
    }

    /// Mark a peer as connected after a completed handshake.
    ///
    /// Returns `true` when the peer was not connected before, i.e. this is a
    /// new connection worth announcing.
    pub fn mark_connected(&self, id: &PeerId) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let entry = peers.entry(id.clone()).or_insert_with(|| PeerEntry {
            id: id.clone(),
            addrs: Vec::new(),
            state: PeerState::Known,
            connected_at: None,
            last_seen: now,
        });
        entry.last_seen = now;
        entry.connected_at.get_or_insert(now);
        let was_connected = entry.state == PeerState::Connected;
        entry.state = PeerState::Connected;
        !was_connected
    }

    /// Mark a peer as disconnected (but keep its entry for possible reconnect).
    pub fn mark_disconnected(&self, id: &PeerId) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(id) {
            entry.state = PeerState::Disconnected;
        }
    }

    /// Remove a peer entirely.
    pub fn remove_peer(&self, id: &PeerId) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(id)
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(id).cloned()
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.get_peer(id)
            .is_some_and(|p| p.state == PeerState::Connected)
    }

    /// All connected peers, sorted by id.
    pub fn connected_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<PeerEntry> = peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn all_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_addrs_creates_known_peer() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("node-1");
        registry.add_addrs(&id, &[addr(9000)]);

        let peer = registry.get_peer(&id).unwrap();
        assert_eq!(peer.state, PeerState::Known);
        assert_eq!(peer.addrs, vec![addr(9000)]);
        assert!(peer.connected_at.is_none());
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_newest_addrs_first_without_duplicates() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("node-1");
        registry.add_addrs(&id, &[addr(1), addr(2)]);
        registry.add_addrs(&id, &[addr(3), addr(1)]);
        assert_eq!(
            registry.get_peer(&id).unwrap().addrs,
            vec![addr(3), addr(1), addr(2)]
        );
    }

    #[test]
    fn test_mark_connected_reports_transition() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("node-1");
        assert!(registry.mark_connected(&id));
        assert!(!registry.mark_connected(&id));
        assert!(registry.is_connected(&id));

        registry.mark_disconnected(&id);
        assert_eq!(registry.connected_count(), 0);
        assert!(registry.mark_connected(&id));
        assert!(registry.get_peer(&id).unwrap().connected_at.is_some());
    }

    #[test]
    fn test_connected_peers_sorted() {
        let registry = PeerRegistry::new();
        for name in ["c", "a", "b"] {
            registry.mark_connected(&PeerId::new(name));
        }
        registry.add_addrs(&PeerId::new("d"), &[addr(1)]);
        let ids: Vec<String> = registry
            .connected_peers()
            .iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_peer() {
        let registry = PeerRegistry::new();
        let id = PeerId::new("node-1");
        registry.mark_connected(&id);
        assert!(registry.remove_peer(&id).is_some());
        assert_eq!(registry.total_count(), 0);
    }
}
