//! # Message Store & Vector Clock
//!
//! Per-origin archive of every gossiped packet (rumors, TLC messages,
//! Whisper status advertisements) keyed by sequence number, together with
//! the vector clock of next-expected sequences. The two live behind one
//! lock so the clock can never disagree with the archive.
//!
//! Invariant: for every origin, every sequence in `[1, next_expected)` is
//! present in the archive. Out-of-order arrivals are retained; the clock
//! advances only when the prefix is complete, possibly jumping several
//! steps when a gap fills.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::packet::{GossipPacket, PeerStatus, StatusPacket};

#[derive(Debug, Default)]
struct OriginLog {
    messages: BTreeMap<u32, GossipPacket>,
    /// Smallest sequence not yet stored. Starts at 1.
    next_expected: u32,
}

impl OriginLog {
    fn new() -> Self {
        Self {
            messages: BTreeMap::new(),
            next_expected: 1,
        }
    }

    fn advance(&mut self) {
        while self.messages.contains_key(&self.next_expected) {
            self.next_expected += 1;
        }
    }
}

/// The shared gossip archive. Messages are immutable once stored and never
/// evicted; duplicates are idempotent.
#[derive(Default)]
pub struct MessageStore {
    origins: RwLock<HashMap<String, OriginLog>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a packet under (origin, id) with load-or-store semantics and
    /// advances the origin's clock. Returns `true` when the pair was
    /// already present (the message is known).
    pub fn insert(&self, origin: &str, id: u32, packet: GossipPacket) -> bool {
        let mut origins = self.origins.write();
        let log = origins
            .entry(origin.to_string())
            .or_insert_with(OriginLog::new);

        let known = log.messages.contains_key(&id);
        if !known {
            log.messages.insert(id, packet);
            log.advance();
        }
        known
    }

    /// The stored packet for (origin, id), if any.
    pub fn get(&self, origin: &str, id: u32) -> Option<GossipPacket> {
        self.origins
            .read()
            .get(origin)
            .and_then(|log| log.messages.get(&id))
            .cloned()
    }

    /// Next-expected sequence for an origin (1 when unknown).
    pub fn next_expected(&self, origin: &str) -> u32 {
        self.origins
            .read()
            .get(origin)
            .map(|log| log.next_expected)
            .unwrap_or(1)
    }

    /// Snapshot of the vector clock as a wire status packet.
    pub fn status(&self) -> StatusPacket {
        let origins = self.origins.read();
        StatusPacket {
            want: origins
                .iter()
                .map(|(origin, log)| PeerStatus {
                    identifier: origin.clone(),
                    next_id: log.next_expected,
                })
                .collect(),
        }
    }

    /// First entry the peer is missing relative to the local clock: either
    /// an origin the peer does not know at all (send its first message) or
    /// an origin where the peer's next-expected lags ours (send exactly
    /// that message).
    pub fn entry_peer_needs(&self, peer_status: &StatusPacket) -> Option<PeerStatus> {
        let theirs: HashMap<&str, u32> = peer_status
            .want
            .iter()
            .map(|entry| (entry.identifier.as_str(), entry.next_id))
            .collect();

        let origins = self.origins.read();
        for (origin, log) in origins.iter() {
            match theirs.get(origin.as_str()) {
                None if log.next_expected > 1 => {
                    return Some(PeerStatus {
                        identifier: origin.clone(),
                        next_id: 1,
                    })
                }
                Some(&their_next) if log.next_expected > their_next => {
                    return Some(PeerStatus {
                        identifier: origin.clone(),
                        next_id: their_next,
                    })
                }
                _ => {}
            }
        }
        None
    }

    /// True when the peer's status advertises anything the local store
    /// lacks. Also the component-wise `peer VC <= local VC` test used by
    /// the TLC causal gate (negated).
    pub fn needs_from(&self, peer_status: &StatusPacket) -> bool {
        let origins = self.origins.read();
        peer_status.want.iter().any(|entry| {
            let local_next = origins
                .get(&entry.identifier)
                .map(|log| log.next_expected)
                .unwrap_or(1);
            entry.next_id > local_next
        })
    }
}
