//! # Peer Set
//!
//! Thread-safe set of known peer UDP endpoints. Identity is the endpoint's
//! string form; the node's own gossip address is never admitted. Any worker
//! may add a peer — the UDP read loop records every sender it hears from.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Shared set of peer endpoints, insertion-ordered but order-irrelevant.
pub struct PeerSet {
    own_addr: SocketAddr,
    peers: RwLock<Vec<SocketAddr>>,
}

impl PeerSet {
    /// Creates a peer set seeded with the initial endpoints, excluding the
    /// node's own gossip address and duplicates.
    pub fn new(own_addr: SocketAddr, initial: &[SocketAddr]) -> Self {
        let set = Self {
            own_addr,
            peers: RwLock::new(Vec::new()),
        };
        for peer in initial {
            set.add(*peer);
        }
        set
    }

    /// Adds an endpoint. No-op if it equals the node's own address or is
    /// already present.
    pub fn add(&self, peer: SocketAddr) {
        if peer == self.own_addr {
            return;
        }
        let mut peers = self.peers.write();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    /// Copy-on-read list of all known peers.
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.peers.read().clone()
    }

    /// Peers not contained in `excluded`, for gossip fan-out.
    pub fn difference_excluding(&self, excluded: &[SocketAddr]) -> Vec<SocketAddr> {
        let excluded: HashSet<&SocketAddr> = excluded.iter().collect();
        self.peers
            .read()
            .iter()
            .filter(|peer| !excluded.contains(peer))
            .copied()
            .collect()
    }

    /// A uniformly random peer, excluding the given endpoints. `None` when
    /// no other peer is known.
    pub fn random_excluding(&self, excluded: &[SocketAddr]) -> Option<SocketAddr> {
        self.difference_excluding(excluded)
            .choose(&mut rand::thread_rng())
            .copied()
    }

    /// A uniformly random peer.
    pub fn random(&self) -> Option<SocketAddr> {
        self.random_excluding(&[])
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// True when no peer is known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Comma-joined endpoint list for the PEERS print.
    pub fn joined(&self) -> String {
        self.peers
            .read()
            .iter()
            .map(|peer| peer.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn own_address_is_never_admitted() {
        let set = PeerSet::new(addr(5000), &[addr(5000), addr(5001)]);
        assert_eq!(set.snapshot(), vec![addr(5001)]);

        set.add(addr(5000));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn duplicates_are_ignored() {
        let set = PeerSet::new(addr(5000), &[]);
        set.add(addr(5001));
        set.add(addr(5001));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn difference_excluding_filters() {
        let set = PeerSet::new(addr(5000), &[addr(5001), addr(5002), addr(5003)]);
        let rest = set.difference_excluding(&[addr(5002)]);
        assert_eq!(rest, vec![addr(5001), addr(5003)]);
    }

    #[test]
    fn random_excluding_respects_exclusions() {
        let set = PeerSet::new(addr(5000), &[addr(5001), addr(5002)]);
        for _ in 0..20 {
            let pick = set.random_excluding(&[addr(5001)]).unwrap();
            assert_eq!(pick, addr(5002));
        }
        assert!(set
            .random_excluding(&[addr(5001), addr(5002)])
            .is_none());
    }

    #[test]
    fn joined_renders_comma_separated() {
        let set = PeerSet::new(addr(5000), &[addr(5001), addr(5002)]);
        assert_eq!(set.joined(), "127.0.0.1:5001,127.0.0.1:5002");
    }
}
