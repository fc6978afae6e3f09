//! In-process network
//!
//! `MemoryNetwork` is a hub of endpoints addressed by `PeerAddr`. Each
//! endpoint gets a `MemoryTransport` implementing [`Transport`] and a channel
//! of inbound packets. Connections are symmetric: when `a` connects to `b`,
//! both see each other as peers.

use crate::peer::{create_peer_manager, PeerInfo, SharedPeerManager};
use async_trait::async_trait;
use meshquery_core::{PeerAddr, RouterError, RouterResult, Transport};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bytes delivered to an endpoint
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub from: PeerAddr,
    pub tag: String,
    pub bytes: Vec<u8>,
}

struct Endpoint {
    inbox: mpsc::Sender<InboundPacket>,
    peers: SharedPeerManager,
}

/// Hub connecting in-process endpoints
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<PeerAddr, Endpoint>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint at `addr`
    pub fn endpoint(
        self: &Arc<Self>,
        addr: impl Into<PeerAddr>,
        max_peers: usize,
    ) -> (MemoryTransport, mpsc::Receiver<InboundPacket>) {
        let addr = addr.into();
        let (tx, rx) = create_network_channel();
        let peers = create_peer_manager(max_peers);
        self.endpoints.write().insert(
            addr.clone(),
            Endpoint {
                inbox: tx,
                peers: peers.clone(),
            },
        );
        debug!("Registered endpoint {}", addr);

        let transport = MemoryTransport {
            local: addr,
            network: self.clone(),
            peers,
        };
        (transport, rx)
    }

    /// Drop an endpoint and its links
    pub fn remove(&self, addr: &PeerAddr) {
        let mut endpoints = self.endpoints.write();
        endpoints.remove(addr);
        for endpoint in endpoints.values() {
            endpoint.peers.remove_peer(addr);
        }
    }

    fn link(&self, a: &PeerAddr, b: &PeerAddr) -> bool {
        let endpoints = self.endpoints.read();
        let (Some(ea), Some(eb)) = (endpoints.get(a), endpoints.get(b)) else {
            return false;
        };
        if !ea.peers.add_peer(PeerInfo::new(b.clone())) {
            return false;
        }
        if !eb.peers.add_peer(PeerInfo::new(a.clone())) {
            ea.peers.remove_peer(b);
            return false;
        }
        true
    }

    fn unlink(&self, a: &PeerAddr, b: &PeerAddr) {
        if let Some(endpoint) = self.endpoints.read().get(b) {
            endpoint.peers.remove_peer(a);
        }
    }

    fn inbox(&self, addr: &PeerAddr) -> Option<mpsc::Sender<InboundPacket>> {
        self.endpoints.read().get(addr).map(|e| e.inbox.clone())
    }
}

/// One endpoint's view of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerAddr,
    network: Arc<MemoryNetwork>,
    peers: SharedPeerManager,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }

    pub fn peer_manager(&self) -> SharedPeerManager {
        self.peers.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn connected_peers(&self) -> Vec<PeerAddr> {
        self.peers.addresses()
    }

    async fn connect(&self, addr: &PeerAddr) -> Option<PeerAddr> {
        if addr == &self.local {
            return None;
        }
        if self.peers.contains(addr) {
            return Some(addr.clone());
        }
        if self.network.link(&self.local, addr) {
            info!("{} connected to {}", self.local, addr);
            Some(addr.clone())
        } else {
            debug!("{} could not connect to {}", self.local, addr);
            None
        }
    }

    async fn send(&self, peer: &PeerAddr, tag: &str, bytes: Vec<u8>) -> RouterResult<()> {
        if !self.peers.contains(peer) {
            return Err(RouterError::Network(format!("not connected to {}", peer)));
        }
        let inbox = self
            .network
            .inbox(peer)
            .ok_or_else(|| RouterError::Network(format!("unknown endpoint {}", peer)))?;
        inbox
            .send(InboundPacket {
                from: self.local.clone(),
                tag: tag.to_string(),
                bytes,
            })
            .await
            .map_err(|_| RouterError::Network(format!("endpoint {} closed", peer)))
    }

    fn penalize(&self, peer: &PeerAddr, score: u32, reason: &str) {
        warn!("Penalizing {} by {}: {}", peer, score, reason);
        if self.peers.penalize(peer, score) {
            warn!("Banned peer {}", peer);
            self.network.unlink(&self.local, peer);
        }
    }
}

/// Create an inbound packet channel
pub fn create_network_channel() -> (mpsc::Sender<InboundPacket>, mpsc::Receiver<InboundPacket>) {
    mpsc::channel(1000)
}
