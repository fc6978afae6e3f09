//! Peer management

use meshquery_core::PeerAddr;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Misbehaviour score at which a peer is banned
pub const BAN_THRESHOLD: u32 = 100;

/// Peer information
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub address: PeerAddr,
    pub misbehavior: u32,
}

impl PeerInfo {
    pub fn new(address: PeerAddr) -> Self {
        Self {
            address,
            misbehavior: 0,
        }
    }
}

/// Peer manager for tracking connected peers
pub struct PeerManager {
    peers: RwLock<HashMap<PeerAddr, PeerInfo>>,
    banned: RwLock<HashSet<PeerAddr>>,
    max_peers: usize,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashSet::new()),
            max_peers,
        }
    }

    /// Add a peer; refuses banned peers and peers beyond `max_peers`
    pub fn add_peer(&self, info: PeerInfo) -> bool {
        if self.is_banned(&info.address) {
            return false;
        }

        let mut peers = self.peers.write();
        if peers.contains_key(&info.address) {
            return true;
        }
        if peers.len() >= self.max_peers {
            return false;
        }
        peers.insert(info.address.clone(), info);
        true
    }

    /// Remove a peer
    pub fn remove_peer(&self, address: &PeerAddr) {
        self.peers.write().remove(address);
    }

    pub fn contains(&self, address: &PeerAddr) -> bool {
        self.peers.read().contains_key(address)
    }

    /// Add to a peer's misbehaviour score. Returns true when the peer got
    /// banned and disconnected by this call.
    pub fn penalize(&self, address: &PeerAddr, score: u32) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(address) else {
            return false;
        };
        peer.misbehavior = peer.misbehavior.saturating_add(score);
        if peer.misbehavior < BAN_THRESHOLD {
            return false;
        }
        peers.remove(address);
        self.banned.write().insert(address.clone());
        true
    }

    pub fn is_banned(&self, address: &PeerAddr) -> bool {
        self.banned.read().contains(address)
    }

    /// Addresses of all peers
    pub fn addresses(&self) -> Vec<PeerAddr> {
        let mut addrs: Vec<PeerAddr> = self.peers.read().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Number of connected peers
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

/// Shared peer manager
pub type SharedPeerManager = Arc<PeerManager>;

/// Create a shared peer manager
pub fn create_peer_manager(max_peers: usize) -> SharedPeerManager {
    Arc::new(PeerManager::new(max_peers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_manager() {
        let manager = PeerManager::new(10);
        let a = PeerAddr::from("a:1");
        let b = PeerAddr::from("b:1");

        assert!(manager.add_peer(PeerInfo::new(a.clone())));
        assert!(manager.add_peer(PeerInfo::new(b.clone())));
        assert_eq!(manager.addresses(), vec![a.clone(), b]);

        manager.remove_peer(&a);
        assert_eq!(manager.peer_count(), 1);
    }

    #[test]
    fn test_max_peers() {
        let manager = PeerManager::new(2);

        assert!(manager.add_peer(PeerInfo::new("a:1".into())));
        assert!(manager.add_peer(PeerInfo::new("b:1".into())));
        assert!(!manager.add_peer(PeerInfo::new("c:1".into())));
    }

    #[test]
    fn test_penalize_bans_at_threshold() {
        let manager = PeerManager::new(4);
        let peer = PeerAddr::from("bad:1");
        manager.add_peer(PeerInfo::new(peer.clone()));

        assert!(!manager.penalize(&peer, 60));
        assert!(manager.penalize(&peer, 40));
        assert!(!manager.contains(&peer));
        assert!(!manager.add_peer(PeerInfo::new(peer)));
    }
}
