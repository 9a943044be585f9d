//! Outbound transport seam.
//!
//! The core only knows how to hand encoded bytes to a peer with a delivery
//! mode. Sockets, retransmission and congestion control belong to whatever
//! implements [`Transport`].

use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
};

use bytes::Bytes;
use tracing::trace;

use crate::{
    inbound::InboundBuffer,
    net::{decode_from_bytes, Delivery, Envelope, PeerId},
};

/// Abstract "send" capability consumed by channel endpoints.
pub trait Transport: Send + Sync {
    /// Hands one encoded envelope to the peer. Must not block.
    fn deliver(&self, peer: PeerId, delivery: Delivery, payload: Bytes);
}

/// One recorded delivery.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub peer: PeerId,
    pub delivery: Delivery,
    pub payload: Bytes,
}

impl Delivered {
    pub fn envelope(&self) -> anyhow::Result<Envelope> {
        decode_from_bytes(&self.payload)
    }
}

/// In-process transport that records every delivery in send order.
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<Delivered>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything delivered so far.
    pub fn take(&self) -> Vec<Delivered> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Drains and decodes; undecodable payloads are skipped.
    pub fn take_envelopes(&self) -> Vec<(PeerId, Delivery, Envelope)> {
        self.take()
            .into_iter()
            .filter_map(|d| d.envelope().ok().map(|env| (d.peer, d.delivery, env)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for LoopbackTransport {
    fn deliver(&self, peer: PeerId, delivery: Delivery, payload: Bytes) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Delivered {
                peer,
                delivery,
                payload,
            });
        }
    }
}

/// Routes deliveries straight into another simulation's inbound buffer.
///
/// Each route maps an outbound peer id to the buffer that receives it and the
/// peer id the receiver knows the sender by. Unrouted deliveries vanish.
#[derive(Default)]
pub struct InProcessTransport {
    routes: RwLock<HashMap<PeerId, (PeerId, InboundBuffer)>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, to: PeerId, seen_as: PeerId, buffer: InboundBuffer) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(to, (seen_as, buffer));
        }
    }

    pub fn unroute(&self, to: PeerId) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&to);
        }
    }
}

impl Transport for InProcessTransport {
    fn deliver(&self, peer: PeerId, _delivery: Delivery, payload: Bytes) {
        let Some((seen_as, buffer)) = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&peer).cloned())
        else {
            trace!(?peer, "No route; delivery discarded");
            return;
        };
        buffer.push_bytes(seen_as, &payload);
    }
}
