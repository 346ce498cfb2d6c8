//! # Whisper Peer Routing
//!
//! Tracks, per peer endpoint, the aggregated bloom filter and the minimum
//! PoW that peer advertised. Envelopes are relayed only to peers whose
//! bloom covers the envelope's and whose PoW demand the envelope meets.
//!
//! Advertisements arrive as gossiped [`WhisperStatus`] packets; only
//! packets with a sequence strictly greater than the last applied one for
//! their origin are applied. Blooms merge by OR; PoW demands merge by
//! MIN — a peer that ever tolerated low-PoW traffic keeps receiving it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::packet::WhisperStatus;
use crate::whisper::topic::{bloom_aggregate, bloom_covers, bloom_from_slice, Bloom};
use crate::whisper::{BLOOM_FILTER_EX_CODE, POW_REQUIREMENT_CODE, STATUS_CODE};

/// What one peer advertised.
#[derive(Debug, Clone, Default)]
pub struct PeerParameters {
    /// OR-merged bloom; `None` (nothing advertised yet) matches anything.
    pub bloom: Option<Bloom>,
    /// MIN-merged PoW requirement; `None` demands nothing.
    pub pow: Option<f64>,
}

impl PeerParameters {
    /// Whether an envelope with the given bloom and PoW interests this peer.
    pub fn accepts(&self, envelope_bloom: &Bloom, envelope_pow: f64) -> bool {
        let bloom_ok = match &self.bloom {
            Some(bloom) => bloom_covers(bloom, envelope_bloom),
            None => true,
        };
        bloom_ok && envelope_pow >= self.pow.unwrap_or(0.0)
    }
}

/// Per-peer advertised parameters plus the per-origin sequence guard.
#[derive(Default)]
pub struct PeerStatusTable {
    inner: RwLock<TableState>,
}

#[derive(Default)]
struct TableState {
    peers: HashMap<SocketAddr, PeerParameters>,
    last_id: HashMap<String, u32>,
}

impl PeerStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a status advertisement that arrived from `sender`.
    /// Out-of-date sequences (per origin) are ignored.
    pub fn update(&self, status: &WhisperStatus, sender: SocketAddr) {
        let mut state = self.inner.write();

        let is_new = match state.last_id.get(&status.origin) {
            None => true,
            Some(&last) => status.id > last,
        };
        if !is_new {
            return;
        }
        state.last_id.insert(status.origin.clone(), status.id);

        let entry = state.peers.entry(sender).or_default();

        if status.code == BLOOM_FILTER_EX_CODE || status.code == STATUS_CODE {
            if let Some(advertised) = bloom_from_slice(&status.bloom) {
                entry.bloom = Some(match entry.bloom {
                    Some(current) => bloom_aggregate(&current, &advertised),
                    None => advertised,
                });
            }
        }

        if (status.code == POW_REQUIREMENT_CODE || status.code == STATUS_CODE)
            && status.pow.is_finite()
            && status.pow >= 0.0
        {
            entry.pow = Some(match entry.pow {
                Some(current) => current.min(status.pow),
                None => status.pow,
            });
        }
    }

    /// Snapshot of every peer's parameters.
    pub fn snapshot(&self) -> Vec<(SocketAddr, PeerParameters)> {
        self.inner
            .read()
            .peers
            .iter()
            .map(|(addr, params)| (*addr, params.clone()))
            .collect()
    }

    /// True when some peer other than `origin` would accept the envelope.
    pub fn any_interested(
        &self,
        origin: SocketAddr,
        envelope_bloom: &Bloom,
        envelope_pow: f64,
    ) -> bool {
        self.inner
            .read()
            .peers
            .iter()
            .any(|(addr, params)| *addr != origin && params.accepts(envelope_bloom, envelope_pow))
    }
}
