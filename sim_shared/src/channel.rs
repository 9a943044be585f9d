//! Channel dispatcher.
//!
//! One [`ChannelEndpoint`] exists per logical channel for the lifetime of the
//! dispatcher. `create_or_get` is idempotent and hands out the same `Arc`
//! every time; `try_get` never creates.
//!
//! Reliable sends are stamped with a per-(channel, peer) sequence number so
//! receivers can check ordering. Unreliable sends carry none.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use tracing::{debug, warn};

use crate::{
    error::ConfigError,
    net::{
        encode_to_bytes, ChannelId, Delivery, Envelope, NetworkChannel, Packet, PeerId, Target,
        PROTOCOL_VERSION,
    },
    transport::Transport,
};

/// Connected peers, shared by every endpoint of a dispatcher.
#[derive(Default)]
struct PeerSet {
    peers: RwLock<BTreeSet<PeerId>>,
}

impl PeerSet {
    fn contains(&self, peer: PeerId) -> bool {
        self.peers.read().map(|p| p.contains(&peer)).unwrap_or(false)
    }

    fn snapshot(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Send counters for one endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Processor for one logical channel.
pub struct ChannelEndpoint {
    channel: NetworkChannel,
    peers: Arc<PeerSet>,
    transport: Arc<dyn Transport>,
    reliable_seq: Mutex<HashMap<PeerId, u32>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl ChannelEndpoint {
    pub fn id(&self) -> &ChannelId {
        &self.channel.id
    }

    pub fn delivery(&self) -> Delivery {
        self.channel.delivery
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Broadcasts using the channel's own delivery mode.
    pub fn broadcast(&self, packet: Packet) -> usize {
        match self.channel.delivery {
            Delivery::Reliable => self.send_to_all_reliable(packet),
            Delivery::Unreliable => self.send_to_all_unreliable(packet),
        }
    }

    /// Targeted send using the channel's own delivery mode.
    pub fn send_to(&self, peer: PeerId, packet: Packet) -> bool {
        match self.channel.delivery {
            Delivery::Reliable => self.send_to_one_reliable(peer, packet),
            Delivery::Unreliable => self.send_to_one_unreliable(peer, packet),
        }
    }

    /// Returns how many peers the packet was handed to.
    pub fn send_to_all_reliable(&self, packet: Packet) -> usize {
        // Sequence numbers differ per peer, so each peer gets its own encoding.
        let mut delivered = 0;
        for peer in self.peers.snapshot() {
            if self.send_reliable(peer, Target::Broadcast, packet.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn send_to_all_unreliable(&self, packet: Packet) -> usize {
        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return 0;
        }
        let env = self.envelope(Target::Broadcast, None, packet);
        let Some(payload) = self.encode(&env) else {
            return 0;
        };
        for peer in &peers {
            self.transport
                .deliver(*peer, Delivery::Unreliable, payload.clone());
        }
        self.sent.fetch_add(peers.len() as u64, Ordering::Relaxed);
        peers.len()
    }

    pub fn send_to_one_reliable(&self, peer: PeerId, packet: Packet) -> bool {
        if !self.peers.contains(peer) {
            self.drop_unknown_peer(peer, &packet);
            return false;
        }
        self.send_reliable(peer, Target::Peer(peer), packet)
    }

    pub fn send_to_one_unreliable(&self, peer: PeerId, packet: Packet) -> bool {
        if !self.peers.contains(peer) {
            self.drop_unknown_peer(peer, &packet);
            return false;
        }
        let env = self.envelope(Target::Peer(peer), None, packet);
        let Some(payload) = self.encode(&env) else {
            return false;
        };
        self.transport.deliver(peer, Delivery::Unreliable, payload);
        self.sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn send_reliable(&self, peer: PeerId, target: Target, packet: Packet) -> bool {
        // Holding the lock across deliver keeps per-peer order equal to seq order.
        let Ok(mut seqs) = self.reliable_seq.lock() else {
            return false;
        };
        let next = seqs.get(&peer).copied().unwrap_or(0);
        let env = self.envelope(target, Some(next), packet);
        let Some(payload) = self.encode(&env) else {
            return false;
        };
        seqs.insert(peer, next.wrapping_add(1));
        self.transport.deliver(peer, Delivery::Reliable, payload);
        self.sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn envelope(&self, target: Target, seq: Option<u32>, packet: Packet) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            channel: self.channel.id.clone(),
            target,
            seq,
            packet,
        }
    }

    fn encode(&self, env: &Envelope) -> Option<bytes::Bytes> {
        match encode_to_bytes(env) {
            Ok(payload) => Some(payload),
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %self.channel.id, packet = env.packet.kind(), error = %e, "Dropping unencodable packet");
                None
            }
        }
    }

    fn drop_unknown_peer(&self, peer: PeerId, packet: &Packet) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %self.channel.id, ?peer, packet = packet.kind(), "Send to unknown peer dropped");
    }

    fn forget_peer(&self, peer: PeerId) {
        if let Ok(mut seqs) = self.reliable_seq.lock() {
            seqs.remove(&peer);
        }
    }
}

/// Owns and caches one endpoint per channel.
pub struct ChannelDispatcher {
    transport: Arc<dyn Transport>,
    peers: Arc<PeerSet>,
    endpoints: RwLock<HashMap<ChannelId, Arc<ChannelEndpoint>>>,
}

impl ChannelDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            peers: Arc::new(PeerSet::default()),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the endpoint for `channel`, creating it on first use.
    ///
    /// Asking for an existing channel with a different delivery mode is a
    /// configuration error.
    pub fn create_or_get(
        &self,
        channel: &NetworkChannel,
    ) -> Result<Arc<ChannelEndpoint>, ConfigError> {
        if let Some(existing) = self.try_get(&channel.id) {
            return Self::check_mode(existing, channel);
        }
        let mut endpoints = self
            .endpoints
            .write()
            .map_err(|_| ConfigError::InvalidConfig("channel table poisoned".into()))?;
        // Another caller may have won the race between the read and the write lock.
        if let Some(existing) = endpoints.get(&channel.id) {
            return Self::check_mode(existing.clone(), channel);
        }
        let endpoint = Arc::new(ChannelEndpoint {
            channel: channel.clone(),
            peers: self.peers.clone(),
            transport: self.transport.clone(),
            reliable_seq: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        endpoints.insert(channel.id.clone(), endpoint.clone());
        debug!(channel = %channel.id, delivery = ?channel.delivery, "Channel endpoint created");
        Ok(endpoint)
    }

    /// Lookup without creation.
    pub fn try_get(&self, id: &ChannelId) -> Option<Arc<ChannelEndpoint>> {
        self.endpoints.read().ok()?.get(id).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.endpoints.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn connect_peer(&self, peer: PeerId) {
        if let Ok(mut peers) = self.peers.peers.write() {
            peers.insert(peer);
        }
    }

    /// Removes the peer; nothing is addressed to it afterwards.
    pub fn disconnect_peer(&self, peer: PeerId) {
        if let Ok(mut peers) = self.peers.peers.write() {
            peers.remove(&peer);
        }
        if let Ok(endpoints) = self.endpoints.read() {
            for endpoint in endpoints.values() {
                endpoint.forget_peer(peer);
            }
        }
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.snapshot()
    }

    fn check_mode(
        existing: Arc<ChannelEndpoint>,
        requested: &NetworkChannel,
    ) -> Result<Arc<ChannelEndpoint>, ConfigError> {
        if existing.delivery() != requested.delivery {
            return Err(ConfigError::ChannelModeConflict {
                channel: requested.id.clone(),
                existing: existing.delivery(),
                requested: requested.delivery,
            });
        }
        Ok(existing)
    }
}
