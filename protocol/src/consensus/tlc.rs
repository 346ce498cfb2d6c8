//! # Threshold Logical Clock
//!
//! Gossip-with-confirmation: an unconfirmed proposal is rumor-mongered
//! stubbornly until a strict majority of distinct origins ack it, at which
//! point a confirmed copy is broadcast. A node's round (`my_time`) advances
//! — atomically, once per round — when a strict majority of distinct
//! origins have *confirmed* the current round.
//!
//! ## Round of a message
//!
//! The round of a peer's message is the number of that origin's tracked
//! confirmed ids strictly below it (compared by the confirmed id for
//! confirmed messages, by the message id otherwise).
//!
//! ## Causal gate
//!
//! A confirmed message is accepted only when its vector clock is
//! component-wise ≤ the local clock — everything the sender depended on is
//! already stored locally. Otherwise the local node sends its status to
//! the sender (to trigger the missing exchange) and requeues the message.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::config::{NodeConfig, CHANNEL_CAPACITY, TLC_QUEUE_TIMEOUT};
use crate::consensus::block::{BlockPublish, TxPublish, ZERO_HASH};
use crate::events::{EventBus, FileEvent};
use crate::gossip::GossipEngine;
use crate::output;
use crate::packet::{GossipPacket, TlcAck, TlcMessage};
use crate::routing::Forwarder;
use std::time::Duration;

/// Injectable source of per-message fitness values. Production uses
/// uniform random [0, 1); tests inject deterministic sequences.
pub type FitnessSource = Box<dyn Fn() -> f32 + Send + Sync>;

/// The TLC/QSC consensus engine.
pub struct ConsensusEngine {
    pub(crate) config: Arc<NodeConfig>,
    pub(crate) gossip: Arc<GossipEngine>,
    forwarder: Arc<Forwarder>,
    pub(crate) events: Arc<EventBus>,
    /// Current round. Monotone, advanced only on majority confirmation.
    my_time: AtomicU32,
    /// Intake for acks addressed to the active gossip-with-confirmation
    /// round; replaced at the start of each round.
    ack_intake: Mutex<Option<mpsc::Sender<TlcAck>>>,
    /// Woken whenever a confirmation lands for any round.
    confirm_notify: Notify,
    /// round → origin → confirmed message.
    confirmations: DashMap<u32, HashMap<String, TlcMessage>>,
    /// round → origin → unconfirmed message observed (QSC evidence).
    messages_seen: DashMap<u32, HashMap<String, TlcMessage>>,
    /// origin → confirmed ids accepted through the causal gate.
    tlc_status: DashMap<String, BTreeSet<u32>>,
    /// Committed chain, keyed by block hash.
    pub(crate) committed: DashMap<[u8; 32], BlockPublish>,
    /// Hash of the top committed block.
    pub(crate) top_hash: Mutex<[u8; 32]>,
    /// Parent hash for the next proposal. Tracks the top hash except when
    /// a QSC round fails, where it follows the best losing block.
    pub(crate) previous_hash: Mutex<[u8; 32]>,
    fitness: FitnessSource,
}

impl ConsensusEngine {
    pub fn new(
        config: Arc<NodeConfig>,
        gossip: Arc<GossipEngine>,
        forwarder: Arc<Forwarder>,
        events: Arc<EventBus>,
        fitness: Option<FitnessSource>,
    ) -> Self {
        Self {
            config,
            gossip,
            forwarder,
            events,
            my_time: AtomicU32::new(0),
            ack_intake: Mutex::new(None),
            confirm_notify: Notify::new(),
            confirmations: DashMap::new(),
            messages_seen: DashMap::new(),
            tlc_status: DashMap::new(),
            committed: DashMap::new(),
            top_hash: Mutex::new(ZERO_HASH),
            previous_hash: Mutex::new(ZERO_HASH),
            fitness: fitness
                .unwrap_or_else(|| Box::new(|| rand::thread_rng().gen_range(0.0..1.0))),
        }
    }

    /// The node's current round.
    pub fn my_time(&self) -> u32 {
        self.my_time.load(Ordering::SeqCst)
    }

    // -- message creation ---------------------------------------------------

    /// Creates, stores and returns a TLC message carrying `block`.
    pub(crate) fn create_tlc_message(
        &self,
        block: BlockPublish,
        confirmed: i32,
        fitness: f32,
    ) -> TlcMessage {
        let tlc = TlcMessage {
            origin: self.config.name.clone(),
            id: self.gossip.next_seq(),
            confirmed,
            tx_block: block,
            vector_clock: self.gossip.store().status(),
            fitness,
        };
        self.gossip
            .store()
            .insert(&tlc.origin, tlc.id, GossipPacket::Tlc(tlc.clone()));
        tlc
    }

    /// Builds the unconfirmed proposal for a freshly indexed file, linked
    /// to the current previous-block hash.
    pub fn make_publish_message(&self, name: &str, size: i64, metafile_hash: Vec<u8>) -> TlcMessage {
        let block = BlockPublish {
            prev_hash: *self.previous_hash.lock(),
            transaction: TxPublish {
                name: name.to_string(),
                size,
                metafile_hash,
            },
        };
        self.create_tlc_message(block, -1, (self.fitness)())
    }

    // -- ack plumbing -------------------------------------------------------

    /// Routes an ack addressed to this node into the active round, if any.
    pub fn deliver_ack(&self, ack: TlcAck) {
        if let Some(tx) = self.ack_intake.lock().as_ref() {
            let _ = tx.try_send(ack);
        }
    }

    fn reset_ack_intake(&self) -> mpsc::Receiver<TlcAck> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        *self.ack_intake.lock() = Some(tx);
        rx
    }

    // -- gossip with confirmation -------------------------------------------

    /// Runs one TLC round: gossip-with-confirmation that waits for a
    /// majority of round confirmations before returning.
    pub async fn tlc_round(&self, tlc: TlcMessage) {
        self.gossip_with_confirmation(tlc, true).await;
    }

    /// Emits an unconfirmed proposal and stubbornly re-mongers it until a
    /// majority of distinct origins ack it; then broadcasts the confirmed
    /// copy. With `wait_confirmations` the call additionally blocks until
    /// a majority of distinct origins have confirmed the current round,
    /// advancing `my_time`.
    pub async fn gossip_with_confirmation(&self, tlc: TlcMessage, wait_confirmations: bool) {
        if self.config.hw3ex2 {
            output::tlc_gossip(&tlc);
        }

        let packet = GossipPacket::Tlc(tlc.clone());
        self.gossip.spawn_monger(
            packet.clone(),
            tlc.origin.clone(),
            tlc.id,
            self.own_addr(),
        );

        // A majority may already have confirmed this round.
        if wait_confirmations && self.check_majority(&tlc, false) {
            return;
        }

        if self.config.stubborn_timeout_secs == 0 {
            return;
        }

        let mut ack_rx = self.reset_ack_intake();
        let mut witnesses: BTreeSet<String> = BTreeSet::new();
        witnesses.insert(self.config.name.clone());
        let mut delivered = false;

        let mut stubborn = interval(Duration::from_secs(self.config.stubborn_timeout_secs));
        stubborn.tick().await; // immediate first tick already emitted above

        loop {
            tokio::select! {
                ack = ack_rx.recv() => {
                    let Some(ack) = ack else { return };
                    if ack.id != tlc.id || delivered {
                        continue;
                    }
                    witnesses.insert(ack.origin);
                    if !self.config.majority(witnesses.len()) {
                        continue;
                    }

                    let confirmed = self.create_tlc_message(
                        tlc.tx_block.clone(),
                        tlc.id as i32,
                        tlc.fitness,
                    );
                    self.broadcast_confirmed(&confirmed, &witnesses);
                    delivered = true;

                    if wait_confirmations {
                        self.save_confirmation(self.my_time(), &confirmed.origin.clone(), confirmed);
                        self.confirm_notify.notify_one();
                    } else {
                        return;
                    }
                }
                _ = self.confirm_notify.notified() => {
                    if wait_confirmations && self.check_majority(&tlc, delivered) {
                        return;
                    }
                }
                _ = stubborn.tick() => {
                    if self.config.hw3ex2 {
                        output::tlc_gossip(&tlc);
                    }
                    self.gossip.spawn_monger(
                        packet.clone(),
                        tlc.origin.clone(),
                        tlc.id,
                        self.own_addr(),
                    );
                }
            }
        }
    }

    fn own_addr(&self) -> SocketAddr {
        self.config.gossip_addr
    }

    /// Re-broadcasts the confirmed copy of a proposal and surfaces the
    /// indexed file (QSC surfaces it only after consensus instead).
    fn broadcast_confirmed(&self, confirmed: &TlcMessage, witnesses: &BTreeSet<String>) {
        let names: Vec<String> = witnesses.iter().cloned().collect();
        output::rebroadcast(confirmed.id, &names);

        self.gossip.spawn_monger(
            GossipPacket::Tlc(confirmed.clone()),
            confirmed.origin.clone(),
            confirmed.id,
            self.own_addr(),
        );

        if !self.config.hw3ex4 {
            let tx = &confirmed.tx_block.transaction;
            self.events.file_indexed(FileEvent {
                name: tx.name.clone(),
                meta_hash: hex::encode(&tx.metafile_hash),
                size: tx.size,
            });
        }
    }

    /// Checks whether the current round has a majority of distinct
    /// confirming origins; if so advances `my_time` and — when this node
    /// has not yet delivered its own confirmation — emits it first.
    fn check_majority(&self, tlc: &TlcMessage, delivered: bool) -> bool {
        let round = self.my_time();
        let Some(confirmations) = self.confirmations_for(round) else {
            return false;
        };
        if !self.config.majority(confirmations.len()) {
            return false;
        }

        self.my_time.fetch_add(1, Ordering::SeqCst);

        if self.config.hw3ex3 {
            let pairs: Vec<(String, u32)> = confirmations
                .iter()
                .map(|(origin, message)| (origin.clone(), message.id))
                .collect();
            let line = output::advancing_round(self.my_time(), &pairs);
            self.events.chain_log(line);
        }

        if !delivered {
            let confirmed =
                self.create_tlc_message(tlc.tx_block.clone(), tlc.id as i32, tlc.fitness);
            let witnesses: BTreeSet<String> = confirmations.keys().cloned().collect();
            self.broadcast_confirmed(&confirmed, &witnesses);
        }
        true
    }

    // -- incoming TLC messages ----------------------------------------------

    /// Processes a peer's TLC message: applies the ack policy and, for
    /// confirmed messages, the causal gate. A causally premature message
    /// is handed back through `requeue` after a delay.
    pub async fn handle_tlc_message(
        self: &Arc<Self>,
        tlc: TlcMessage,
        sender: SocketAddr,
        requeue: mpsc::Sender<(TlcMessage, SocketAddr)>,
    ) {
        let round = self.message_round(&tlc.origin, tlc.id, tlc.confirmed);
        debug!(
            origin = %tlc.origin,
            id = tlc.id,
            confirmed = tlc.confirmed,
            round,
            "TLC message"
        );

        let block_ok = !self.config.hw3ex4 || self.block_valid(&tlc.tx_block);
        let round_ok =
            !self.config.hw3ex3 || self.config.ack_all || round >= self.my_time();

        if block_ok && round_ok && tlc.is_unconfirmed() {
            if self.config.hw3ex4 {
                self.save_message_seen(round, &tlc.origin, tlc.clone());
            }

            output::sending_ack(&tlc.origin, tlc.id);
            let ack = GossipPacket::TlcAck(TlcAck {
                origin: self.config.name.clone(),
                id: tlc.id,
                destination: tlc.origin.clone(),
                hop_limit: self.config.hop_limit,
            });
            self.forwarder.forward(ack).await;
        }

        if self.config.hw3ex3 && !tlc.is_unconfirmed() {
            if self.causally_ready(&tlc, sender).await {
                self.save_confirmation(round, &tlc.origin.clone(), tlc);
                self.confirm_notify.notify_one();
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(TLC_QUEUE_TIMEOUT).await;
                    let _ = requeue.send((tlc, sender)).await;
                });
            }
        }
    }

    /// The causal gate: accept a confirmed message only when the local
    /// store already covers its vector clock; otherwise push our status to
    /// the sender so the gap closes.
    async fn causally_ready(&self, tlc: &TlcMessage, sender: SocketAddr) -> bool {
        if self.gossip.store().needs_from(&tlc.vector_clock) {
            let status = GossipPacket::Status(self.gossip.store().status());
            self.gossip_conn_send(&status, sender).await;
            return false;
        }
        self.tlc_status
            .entry(tlc.origin.clone())
            .or_default()
            .insert(tlc.confirmed as u32);
        true
    }

    async fn gossip_conn_send(&self, packet: &GossipPacket, to: SocketAddr) {
        // The gossip engine owns no public transport handle; route the
        // status through the point-to-point forwarder's connection.
        self.forwarder.send_direct(packet, to).await;
    }

    /// Round of a message: how many of the origin's tracked confirmed ids
    /// are strictly below it.
    pub fn message_round(&self, origin: &str, id: u32, confirmed: i32) -> u32 {
        let Some(ids) = self.tlc_status.get(origin) else {
            return 0;
        };
        let threshold = if confirmed > -1 { confirmed as u32 } else { id };
        ids.iter().filter(|&&tracked| tracked < threshold).count() as u32
    }

    // -- confirmation bookkeeping -------------------------------------------

    /// Records a confirmation for `round`; confirmations for rounds the
    /// node already advanced past are ignored.
    pub(crate) fn save_confirmation(&self, round: u32, origin: &str, tlc: TlcMessage) {
        if round < self.my_time() {
            return;
        }
        self.confirmations
            .entry(round)
            .or_default()
            .insert(origin.to_string(), tlc);
    }

    fn save_message_seen(&self, round: u32, origin: &str, tlc: TlcMessage) {
        self.messages_seen
            .entry(round)
            .or_default()
            .insert(origin.to_string(), tlc);
    }

    #[cfg(test)]
    pub(crate) fn save_message_seen_for_tests(&self, round: u32, tlc: TlcMessage) {
        let origin = tlc.origin.clone();
        self.save_message_seen(round, &origin, tlc);
    }

    /// Confirmations recorded for a round.
    pub(crate) fn confirmations_for(&self, round: u32) -> Option<HashMap<String, TlcMessage>> {
        let map = self.confirmations.get(&round)?;
        if map.is_empty() {
            return None;
        }
        Some(map.clone())
    }

    /// Unconfirmed messages observed in a round.
    pub(crate) fn messages_seen_for(&self, round: u32) -> HashMap<String, TlcMessage> {
        self.messages_seen
            .get(&round)
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    // -- block validity ------------------------------------------------------

    /// A block is valid when no committed block claims the same name and
    /// its ancestry is fully known back to the zero hash.
    pub fn block_valid(&self, block: &BlockPublish) -> bool {
        let name_taken = self
            .committed
            .iter()
            .any(|entry| entry.value().transaction.name == block.transaction.name);
        if name_taken {
            return false;
        }

        let mut hash = block.prev_hash;
        while hash != ZERO_HASH {
            match self.committed.get(&hash) {
                Some(parent) => hash = parent.value().prev_hash,
                None => {
                    warn!(
                        prev = %hex::encode(block.prev_hash),
                        "block ancestry unknown"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// File names on the committed chain, oldest first.
    pub fn chain_file_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut hash = *self.top_hash.lock();
        while hash != ZERO_HASH {
            let Some(block) = self.committed.get(&hash) else {
                break;
            };
            names.push(block.value().transaction.name.clone());
            hash = block.value().prev_hash;
        }
        names.reverse();
        names
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{make_block, make_engine};
    use super::*;

    #[tokio::test]
    async fn message_round_counts_tracked_ids() {
        let engine = make_engine(3, true, false, None).await;
        engine.tlc_status.entry("A".into()).or_default().extend([2, 5, 9]);

        // Unconfirmed: compared by id.
        assert_eq!(engine.message_round("A", 1, -1), 0);
        assert_eq!(engine.message_round("A", 6, -1), 2);
        // Confirmed: compared by the confirmed id.
        assert_eq!(engine.message_round("A", 99, 5), 1);
        assert_eq!(engine.message_round("A", 99, 10), 3);
        // Unknown origin: round zero.
        assert_eq!(engine.message_round("B", 4, -1), 0);
    }

    #[tokio::test]
    async fn stale_confirmations_are_ignored() {
        let engine = make_engine(3, true, false, None).await;
        engine.my_time.store(2, Ordering::SeqCst);

        let tlc = engine.create_tlc_message(make_block(&engine, "f"), 7, 0.5);
        engine.save_confirmation(1, "A", tlc.clone());
        assert!(engine.confirmations_for(1).is_none());

        engine.save_confirmation(2, "A", tlc);
        assert_eq!(engine.confirmations_for(2).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn majority_advances_round_once() {
        let engine = make_engine(3, true, false, None).await;
        let proposal = engine.create_tlc_message(make_block(&engine, "f"), -1, 0.5);

        engine.save_confirmation(
            0,
            "A",
            engine.create_tlc_message(make_block(&engine, "a"), 1, 0.1),
        );
        assert!(!engine.check_majority(&proposal, true));
        assert_eq!(engine.my_time(), 0);

        engine.save_confirmation(
            0,
            "B",
            engine.create_tlc_message(make_block(&engine, "b"), 2, 0.2),
        );
        assert!(engine.check_majority(&proposal, true));
        assert_eq!(engine.my_time(), 1);
    }

    #[tokio::test]
    async fn sole_node_confirms_itself() {
        let engine = make_engine(1, true, false, None).await;
        let proposal = engine.create_tlc_message(make_block(&engine, "f"), -1, 0.5);

        engine.save_confirmation(
            0,
            "local",
            engine.create_tlc_message(make_block(&engine, "f"), proposal.id as i32, 0.5),
        );
        assert!(engine.check_majority(&proposal, true));
        assert_eq!(engine.my_time(), 1);
    }

    #[tokio::test]
    async fn block_validity_rejects_duplicate_names_and_unknown_history() {
        let engine = make_engine(3, true, true, None).await;

        let first = BlockPublish {
            prev_hash: ZERO_HASH,
            transaction: TxPublish {
                name: "claimed".into(),
                size: 1,
                metafile_hash: vec![1; 32],
            },
        };
        engine.committed.insert(first.hash(), first.clone());

        // Same name again: invalid.
        let duplicate = BlockPublish {
            prev_hash: first.hash(),
            transaction: first.transaction.clone(),
        };
        assert!(!engine.block_valid(&duplicate));

        // Fresh name on a known parent: valid.
        let extending = BlockPublish {
            prev_hash: first.hash(),
            transaction: TxPublish {
                name: "fresh".into(),
                size: 1,
                metafile_hash: vec![2; 32],
            },
        };
        assert!(engine.block_valid(&extending));

        // Fresh name on an unknown parent: invalid.
        let orphan = BlockPublish {
            prev_hash: [0x77; 32],
            transaction: TxPublish {
                name: "orphan".into(),
                size: 1,
                metafile_hash: vec![3; 32],
            },
        };
        assert!(!engine.block_valid(&orphan));
    }

    #[tokio::test]
    async fn chain_file_names_walk_oldest_first() {
        let engine = make_engine(3, true, true, None).await;

        let b0 = BlockPublish {
            prev_hash: ZERO_HASH,
            transaction: TxPublish {
                name: "old".into(),
                size: 1,
                metafile_hash: vec![1; 32],
            },
        };
        let b1 = BlockPublish {
            prev_hash: b0.hash(),
            transaction: TxPublish {
                name: "new".into(),
                size: 1,
                metafile_hash: vec![2; 32],
            },
        };
        engine.committed.insert(b0.hash(), b0);
        engine.committed.insert(b1.hash(), b1.clone());
        *engine.top_hash.lock() = b1.hash();

        assert_eq!(engine.chain_file_names(), vec!["old", "new"]);
    }

    #[tokio::test]
    async fn publish_message_links_to_previous_hash() {
        let engine = make_engine(3, true, false, None).await;
        *engine.previous_hash.lock() = [0x11; 32];

        let tlc = engine.make_publish_message("f.bin", 42, vec![0xcc; 32]);
        assert!(tlc.is_unconfirmed());
        assert_eq!(tlc.tx_block.prev_hash, [0x11; 32]);
        assert_eq!(tlc.tx_block.transaction.name, "f.bin");

        // The proposal is in the gossip store under our own origin.
        assert!(engine.gossip.store().get("local", tlc.id).is_some());
    }

    #[tokio::test]
    async fn injected_fitness_is_used() {
        let engine = make_engine(3, true, true, Some(Box::new(|| 0.75))).await;
        let tlc = engine.make_publish_message("f.bin", 1, vec![0; 32]);
        assert_eq!(tlc.fitness, 0.75);
    }

    #[tokio::test]
    async fn acks_flow_into_active_round() {
        let engine = make_engine(3, true, false, None).await;
        let mut rx = engine.reset_ack_intake();

        engine.deliver_ack(TlcAck {
            origin: "B".into(),
            id: 9,
            destination: "local".into(),
            hop_limit: 10,
        });
        let ack = rx.try_recv().expect("ack routed");
        assert_eq!(ack.origin, "B");
        assert_eq!(ack.id, 9);
    }
}
