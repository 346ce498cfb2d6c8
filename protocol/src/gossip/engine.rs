//! # Gossip Engine
//!
//! Rumor mongering with coin-flip continuation, status-driven three-way
//! synchronization, and the anti-entropy and route-rumor timers.
//!
//! ## Mongering
//!
//! A new message is pushed to one random peer at a time. Each attempt
//! registers a listener keyed by (peer, origin, sequence) and waits up to
//! [`RUMOR_TIMEOUT`] for a status showing the peer has advanced past the
//! pushed sequence. On acknowledgement a fair coin decides whether to
//! continue with a fresh peer; on timeout the attempt stops — lost
//! datagrams are recovered by anti-entropy, not by blind retries.
//!
//! ## Status resolution
//!
//! For an incoming status the outcome is exactly one of: send the first
//! message the peer is missing, answer with our own status because the
//! peer is ahead, or declare the pair IN SYNC.

use dashmap::DashMap;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::debug;

use crate::config::{NodeConfig, RUMOR_TIMEOUT};
use crate::events::EventBus;
use crate::gossip::store::MessageStore;
use crate::output;
use crate::packet::{GossipPacket, RumorMessage, StatusPacket, WhisperStatus};
use crate::peers::PeerSet;
use crate::routing::RoutingTable;
use crate::transport::ConnectionHandler;
use std::time::Duration;

/// One active mongering attempt, keyed by the peer it targets and the
/// message it pushes.
type ListenerKey = (SocketAddr, String, u32);

/// The gossip engine. Shared by every worker that produces or consumes
/// gossiped packets (rumors, TLC messages, Whisper statuses).
pub struct GossipEngine {
    config: Arc<NodeConfig>,
    conn: Arc<ConnectionHandler>,
    peers: Arc<PeerSet>,
    routing: Arc<RoutingTable>,
    store: Arc<MessageStore>,
    events: Arc<EventBus>,
    /// Next sequence number for locally authored gossip. Shared by rumors,
    /// TLC messages and Whisper statuses.
    seq: AtomicU32,
    /// Wakeup channels for in-flight mongering attempts.
    listeners: DashMap<ListenerKey, mpsc::Sender<()>>,
}

impl GossipEngine {
    pub fn new(
        config: Arc<NodeConfig>,
        conn: Arc<ConnectionHandler>,
        peers: Arc<PeerSet>,
        routing: Arc<RoutingTable>,
        store: Arc<MessageStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            conn,
            peers,
            routing,
            store,
            events,
            seq: AtomicU32::new(1),
            listeners: DashMap::new(),
        }
    }

    /// The shared message archive.
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Allocates the next local gossip sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates, stores and returns a locally authored rumor. Empty text
    /// produces a route rumor that is not surfaced to the viewer.
    pub fn create_rumor(&self, text: &str) -> RumorMessage {
        let rumor = RumorMessage {
            origin: self.config.name.clone(),
            id: self.next_seq(),
            text: text.to_string(),
        };
        self.store.insert(
            &rumor.origin,
            rumor.id,
            GossipPacket::Rumor(rumor.clone()),
        );
        if !rumor.text.is_empty() {
            self.events.rumor(rumor.clone());
        }
        rumor
    }

    /// Stamps a Whisper status with the local origin and a fresh gossip
    /// sequence, stores it, and mongers it like any rumor.
    pub fn send_whisper_status(self: &Arc<Self>, mut status: WhisperStatus) {
        status.origin = self.config.name.clone();
        status.id = self.next_seq();
        let packet = GossipPacket::WhisperStatus(status.clone());
        self.store.insert(&status.origin, status.id, packet.clone());
        self.spawn_monger(packet, status.origin, status.id, self.conn.own_addr());
    }

    /// Shared intake for every gossiped packet kind.
    ///
    /// Prints the packet, updates routing for foreign origins, stores the
    /// message, answers the sender with the local status, and — when the
    /// message is new — starts mongering it onwards.
    pub async fn handle_gossip(
        self: &Arc<Self>,
        packet: GossipPacket,
        origin: &str,
        id: u32,
        sender: SocketAddr,
    ) {
        match &packet {
            GossipPacket::Rumor(rumor) => {
                output::rumor(origin, sender, id, &rumor.text);
                output::peers(&self.peers.joined());
            }
            GossipPacket::Tlc(tlc) => {
                if self.config.hw3ex2 {
                    if let Some(line) = output::tlc_gossip(tlc) {
                        self.events.chain_log(line);
                    }
                }
            }
            _ => {}
        }

        let mut known = true;
        if origin != self.config.name {
            let announce = matches!(&packet, GossipPacket::Rumor(r) if !r.text.is_empty());
            self.routing.update(origin, id, sender, announce);
            known = self.store.insert(origin, id, packet.clone());
        }

        // Acknowledge with our clock regardless of novelty.
        let status = GossipPacket::Status(self.store.status());
        self.conn.send(&status, sender).await;

        if !known {
            if let GossipPacket::Rumor(rumor) = &packet {
                if !rumor.text.is_empty() {
                    self.events.rumor(rumor.clone());
                }
            }
            self.spawn_monger(packet, origin.to_string(), id, sender);
        }
    }

    /// Spawns the mongering loop for a stored message, avoiding the peer
    /// it came from.
    pub fn spawn_monger(
        self: &Arc<Self>,
        packet: GossipPacket,
        origin: String,
        id: u32,
        avoid: SocketAddr,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.monger(packet, &origin, id, avoid).await;
        });
    }

    /// The mongering loop: push to one random peer, await its status, flip
    /// a coin on acknowledgement, stop on timeout or tails.
    async fn monger(&self, packet: GossipPacket, origin: &str, id: u32, avoid: SocketAddr) {
        let Some(mut peer) = self.peers.random_excluding(&[avoid]) else {
            return;
        };

        loop {
            let acknowledged = self.monger_once(&packet, origin, id, peer).await;
            if !acknowledged {
                debug!(%peer, origin, id, "mongering timed out");
                return;
            }
            if !rand::thread_rng().gen_bool(0.5) {
                return;
            }
            let Some(next) = self.peers.random_excluding(&[peer]) else {
                return;
            };
            peer = next;
            output::flipped_coin(peer);
        }
    }

    /// One mongering attempt: register the status listener, send, wait.
    /// Returns true when a satisfying status arrived within the timeout.
    async fn monger_once(
        &self,
        packet: &GossipPacket,
        origin: &str,
        id: u32,
        peer: SocketAddr,
    ) -> bool {
        let key = (peer, origin.to_string(), id);
        let (tx, mut rx) = mpsc::channel(1);
        self.listeners.insert(key.clone(), tx);

        output::mongering(peer);
        self.conn.send(packet, peer).await;

        let acknowledged = timeout(RUMOR_TIMEOUT, rx.recv()).await.is_ok();
        self.listeners.remove(&key);
        acknowledged
    }

    /// Wakes every mongering attempt towards `sender` whose pushed
    /// sequence the status now covers.
    fn notify_listeners(&self, status: &StatusPacket, sender: SocketAddr) {
        for entry in self.listeners.iter() {
            let (peer, origin, id) = entry.key();
            if *peer == sender {
                if let Some(next) = status.next_for(origin) {
                    if *id < next {
                        let _ = entry.value().try_send(());
                    }
                }
            }
        }
    }

    /// Three-way status resolution.
    pub async fn handle_status(self: &Arc<Self>, status: StatusPacket, sender: SocketAddr) {
        output::status(sender, &status.want);
        output::peers(&self.peers.joined());

        self.notify_listeners(&status, sender);

        if let Some(needed) = self.store.entry_peer_needs(&status) {
            // The peer is behind: push exactly the message it misses next.
            if let Some(packet) = self.store.get(&needed.identifier, needed.next_id) {
                self.conn.send(&packet, sender).await;
            }
        } else if self.store.needs_from(&status) {
            // The peer is ahead: ask for the difference with our clock.
            let ours = GossipPacket::Status(self.store.status());
            self.conn.send(&ours, sender).await;
        } else {
            output::in_sync(sender);
        }
    }

    /// Anti-entropy worker: periodically push the local status to one
    /// random peer. The first exchange fires immediately.
    pub async fn run_anti_entropy(self: Arc<Self>) {
        if self.config.anti_entropy_secs == 0 {
            return;
        }
        let mut ticker = interval(Duration::from_secs(self.config.anti_entropy_secs));
        loop {
            ticker.tick().await;
            if let Some(peer) = self.peers.random() {
                let status = GossipPacket::Status(self.store.status());
                self.conn.send(&status, peer).await;
            }
        }
    }

    /// Route-rumor worker: broadcast an initial empty rumor so fresh nodes
    /// learn routes quickly, then monger a new one every period.
    pub async fn run_route_rumors(self: Arc<Self>) {
        if self.config.route_timer_secs == 0 {
            return;
        }

        let first = self.create_rumor("");
        let packet = GossipPacket::Rumor(first);
        self.conn
            .broadcast(&packet, &self.peers.snapshot(), None)
            .await;

        let mut ticker = interval(Duration::from_secs(self.config.route_timer_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let rumor = self.create_rumor("");
            let id = rumor.id;
            let origin = rumor.origin.clone();
            self.spawn_monger(GossipPacket::Rumor(rumor), origin, id, self.conn.own_addr());
        }
    }
}
