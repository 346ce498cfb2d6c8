//! # DSDV Routing & Point-to-Point Forwarding
//!
//! Destination-sequenced next-hop tracking: for every origin, the table
//! remembers the UDP endpoint the freshest gossip from that origin arrived
//! through. Freshness is the highest sequence number seen so far — an
//! update is applied only when the observed sequence strictly exceeds the
//! prior maximum, so stale paths never overwrite newer ones.
//!
//! Point-to-point packets (private messages, data requests/replies, search
//! replies, TLC acks) are forwarded hop by hop: decrement the hop limit,
//! drop at zero, silently drop when no route is known.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::output;
use crate::packet::GossipPacket;
use crate::transport::ConnectionHandler;

/// The DSDV table plus the per-origin highest-seen sequence numbers.
#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<RoutingState>,
}

#[derive(Default)]
struct RoutingState {
    next_hop: HashMap<String, SocketAddr>,
    last_id: HashMap<String, u32>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a routing observation: gossip from `origin` with sequence
    /// `id` arrived through `sender`. Updates the next hop only when `id`
    /// strictly exceeds the highest sequence seen for that origin.
    ///
    /// `announce` controls the DSDV print — route rumors (empty text)
    /// update the table silently.
    pub fn update(&self, origin: &str, id: u32, sender: SocketAddr, announce: bool) {
        let mut state = self.inner.write();

        let is_new = match state.last_id.get(origin) {
            None => true,
            Some(&last) => id > last,
        };
        if !is_new {
            return;
        }

        state.last_id.insert(origin.to_string(), id);
        state.next_hop.insert(origin.to_string(), sender);
        if announce {
            output::dsdv(origin, sender);
        }
    }

    /// Next hop towards `destination`, if known.
    pub fn next_hop(&self, destination: &str) -> Option<SocketAddr> {
        self.inner.read().next_hop.get(destination).copied()
    }

    /// All origins with a known route, for the viewer.
    pub fn origins(&self) -> Vec<String> {
        self.inner.read().last_id.keys().cloned().collect()
    }
}

/// Point-to-point forwarder: routing table + transport.
pub struct Forwarder {
    routing: Arc<RoutingTable>,
    conn: Arc<ConnectionHandler>,
}

impl Forwarder {
    pub fn new(routing: Arc<RoutingTable>, conn: Arc<ConnectionHandler>) -> Self {
        Self { routing, conn }
    }

    /// Sends a packet straight to a known endpoint, bypassing the table.
    pub async fn send_direct(&self, packet: &GossipPacket, to: SocketAddr) {
        self.conn.send(packet, to).await;
    }

    /// Forwards a point-to-point packet one hop towards its destination.
    ///
    /// Decrements the packet's hop limit; drops it silently when the limit
    /// is exhausted, when no route to the destination is known, or when
    /// the packet kind carries no destination at all.
    pub async fn forward(&self, mut packet: GossipPacket) {
        let Some((destination, hop_limit)) = routable_fields(&mut packet) else {
            return;
        };
        if *hop_limit == 0 {
            return;
        }
        *hop_limit -= 1;

        if let Some(next) = self.routing.next_hop(&destination) {
            self.conn.send(&packet, next).await;
        }
    }
}

/// The (destination, hop-limit) pair of a point-to-point packet.
fn routable_fields(packet: &mut GossipPacket) -> Option<(String, &mut u32)> {
    match packet {
        GossipPacket::Private(p) => Some((p.destination.clone(), &mut p.hop_limit)),
        GossipPacket::DataRequest(p) => Some((p.destination.clone(), &mut p.hop_limit)),
        GossipPacket::DataReply(p) => Some((p.destination.clone(), &mut p.hop_limit)),
        GossipPacket::SearchReply(p) => Some((p.destination.clone(), &mut p.hop_limit)),
        GossipPacket::TlcAck(p) => Some((p.destination.clone(), &mut p.hop_limit)),
        _ => None,
    }
}
