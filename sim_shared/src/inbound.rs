//! External -> simulation handoff.
//!
//! Network threads push decoded envelopes into an [`InboundBuffer`]; the tick
//! drains it once at the start of the input stage. Transport order is not
//! trusted: [`InputSequencer`] discards input that is not newer than what was
//! already applied for that peer.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tracing::{debug, warn};

use crate::net::{decode_from_bytes, Envelope, PeerId};

/// Cloneable, lock-protected FIFO of received envelopes.
#[derive(Clone, Default)]
pub struct InboundBuffer {
    inner: Arc<Mutex<VecDeque<(PeerId, Envelope)>>>,
}

impl InboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, peer: PeerId, envelope: Envelope) {
        if let Ok(mut q) = self.inner.lock() {
            q.push_back((peer, envelope));
        }
    }

    /// Decodes raw bytes and queues the result. Undecodable payloads are dropped.
    pub fn push_bytes(&self, peer: PeerId, payload: &[u8]) -> bool {
        match decode_from_bytes(payload) {
            Ok(env) => {
                self.push(peer, env);
                true
            }
            Err(e) => {
                warn!(?peer, error = %e, "Dropping undecodable inbound payload");
                false
            }
        }
    }

    /// Everything received so far, oldest first.
    pub fn drain(&self) -> Vec<(PeerId, Envelope)> {
        self.inner
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last accepted input sequence per peer.
#[derive(Debug, Default)]
pub struct InputSequencer {
    last: HashMap<PeerId, u32>,
}

impl InputSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `seq` only if it is newer than the last accepted one.
    pub fn accept(&mut self, peer: PeerId, seq: u32) -> bool {
        match self.last.get(&peer) {
            Some(&last) if seq <= last => {
                debug!(?peer, seq, last, "Stale input rejected");
                false
            }
            _ => {
                self.last.insert(peer, seq);
                true
            }
        }
    }

    pub fn last(&self, peer: PeerId) -> Option<u32> {
        self.last.get(&peer).copied()
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.last.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{encode_to_bytes, LeftPacket, Packet, Target, PROTOCOL_VERSION};

    #[test]
    fn late_sequence_is_rejected() {
        let mut seq = InputSequencer::new();
        assert!(seq.accept(PeerId(1), 7));
        assert!(!seq.accept(PeerId(1), 5));
        assert!(!seq.accept(PeerId(1), 7));
        assert!(seq.accept(PeerId(1), 8));
        assert!(seq.accept(PeerId(2), 0));
    }

    #[test]
    fn forgotten_peer_starts_over() {
        let mut seq = InputSequencer::new();
        seq.accept(PeerId(1), 10);
        seq.forget(PeerId(1));
        assert!(seq.accept(PeerId(1), 1));
    }

    #[test]
    fn buffer_decodes_and_drains_in_order() {
        let buf = InboundBuffer::new();
        let producer = buf.clone();
        let env = Envelope {
            version: PROTOCOL_VERSION,
            channel: crate::net::ChannelId::new("session"),
            target: Target::Broadcast,
            seq: None,
            packet: Packet::Left(LeftPacket { entities: vec![] }),
        };
        let bytes = encode_to_bytes(&env).unwrap();
        assert!(producer.push_bytes(PeerId(3), &bytes));
        assert!(!producer.push_bytes(PeerId(3), b"not json"));
        producer.push(PeerId(4), env.clone());

        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, PeerId(3));
        assert_eq!(drained[1], (PeerId(4), env));
        assert!(buf.is_empty());
    }
}
