//! # Whisper Engine
//!
//! The envelope relay: intake checks (timing, size, PoW, bloom), the
//! envelope cache, subscriber notification, and the three periodic
//! behaviors — re-broadcast, expiry purge, and status advertisement.
//!
//! ## Intake
//!
//! An envelope failing a check is still admitted when some *other* peer's
//! advertised bloom and PoW would accept it — the node relays traffic it
//! has no personal interest in rather than partitioning the overlay. A
//! peer whose envelope is rejected outright is blacklisted and ignored
//! from then on.
//!
//! ## Parameter convergence
//!
//! Bloom and PoW updates are advertised through the gossip layer; the old
//! values stay "tolerated" for [`DEFAULT_SYNC_ALLOWANCE`] seconds so
//! in-flight envelopes from peers that have not yet seen the update are
//! not punished.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep};
use tracing::{debug, warn};

use crate::config::{
    BROADCAST_TIMER, DEFAULT_MIN_POW, DEFAULT_SYNC_ALLOWANCE, DEFAULT_TTL, EXPIRATION_TIMER,
    MAX_MESSAGE_SIZE, MESSAGE_QUEUE_LIMIT, STATUS_TIMER,
};
use crate::gossip::GossipEngine;
use crate::packet::{GossipPacket, WhisperPacket, WhisperStatus};
use crate::transport::ConnectionHandler;
use crate::whisper::crypto::{CryptoError, KeyStore};
use crate::whisper::envelope::Envelope;
use crate::whisper::filter::{Filter, FilterError, FilterStore};
use crate::whisper::message::{MessageKey, MessageParams, ReceivedMessage};
use crate::whisper::routing::PeerStatusTable;
use crate::whisper::topic::{
    bloom_aggregate, bloom_covers, empty_bloom, Bloom, Topic,
};
use crate::whisper::{
    unix_now, BLOOM_FILTER_EX_CODE, MESSAGES_CODE, POW_REQUIREMENT_CODE, STATUS_CODE,
};

/// Envelope intake rejections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope created in the future")]
    FromTheFuture,
    #[error("very old message")]
    VeryOld,
    #[error("huge messages are not allowed")]
    Oversize,
    #[error("envelope proof-of-work too low")]
    LowPow,
    #[error("envelope does not match the bloom filter")]
    BloomMismatch,
}

/// Errors surfaced by the Whisper API.
#[derive(Debug, Error)]
pub enum WhisperError {
    #[error("specify either a symmetric key or a public key, not both")]
    AmbiguousKey,
    #[error("a topic is required with a symmetric key")]
    MissingTopic,
    #[error("invalid proof-of-work requirement")]
    InvalidPow,
    #[error("no filter registered under the given id")]
    UnknownFilter,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("mining task failed")]
    MiningFailed,
}

/// Request to publish one Whisper message.
pub struct NewMessage {
    /// Id of a stored symmetric key; mutually exclusive with `public_key`.
    pub sym_key_id: Option<String>,
    /// SEC1 public key of the recipient.
    pub public_key: Option<Vec<u8>>,
    /// Lifetime in seconds; zero selects [`DEFAULT_TTL`].
    pub ttl: u32,
    pub topic: Topic,
    /// Mining budget in seconds.
    pub pow_time: u32,
    pub payload: Vec<u8>,
}

/// Request to create a subscription.
pub struct FilterOptions {
    pub sym_key_id: Option<String>,
    pub private_key_id: Option<String>,
    pub min_pow: f64,
    pub topics: Vec<Topic>,
}

/// A cached envelope with its computed relay attributes.
#[derive(Clone)]
pub struct EnvelopeEntry {
    pub envelope: Envelope,
    pub pow: f64,
    pub bloom: Bloom,
    /// Endpoint the envelope arrived from (our own for local posts).
    pub origin: SocketAddr,
    pub hash: [u8; 32],
}

struct Parameters {
    min_pow: RwLock<f64>,
    min_pow_tolerated: RwLock<f64>,
    bloom: RwLock<Bloom>,
    bloom_tolerated: RwLock<Option<Bloom>>,
}

/// The Whisper overlay engine.
pub struct Whisper {
    gossip: Arc<GossipEngine>,
    conn: Arc<ConnectionHandler>,
    params: Parameters,
    /// Crypto key storage, exposed for the host API.
    pub keys: KeyStore,
    filters: FilterStore,
    envelopes: RwLock<HashMap<[u8; 32], EnvelopeEntry>>,
    peer_table: PeerStatusTable,
    blacklist: RwLock<HashSet<SocketAddr>>,
    queue_tx: mpsc::Sender<EnvelopeEntry>,
    queue_rx: Mutex<Option<mpsc::Receiver<EnvelopeEntry>>>,
    quit: broadcast::Sender<()>,
}

impl Whisper {
    pub fn new(gossip: Arc<GossipEngine>, conn: Arc<ConnectionHandler>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(MESSAGE_QUEUE_LIMIT);
        let (quit, _) = broadcast::channel(1);
        Self {
            gossip,
            conn,
            params: Parameters {
                min_pow: RwLock::new(DEFAULT_MIN_POW),
                min_pow_tolerated: RwLock::new(DEFAULT_MIN_POW),
                bloom: RwLock::new(empty_bloom()),
                bloom_tolerated: RwLock::new(None),
            },
            keys: KeyStore::new(),
            filters: FilterStore::new(),
            envelopes: RwLock::new(HashMap::new()),
            peer_table: PeerStatusTable::new(),
            blacklist: RwLock::new(HashSet::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            quit,
        }
    }

    // -- parameters ---------------------------------------------------------

    /// The PoW this node demands of incoming envelopes.
    pub fn min_pow(&self) -> f64 {
        *self.params.min_pow.read()
    }

    /// The node's aggregated subscription bloom.
    pub fn bloom(&self) -> Bloom {
        *self.params.bloom.read()
    }

    /// Lowers or raises the PoW requirement and advertises the change;
    /// the old value stays tolerated for the sync allowance.
    pub fn set_min_pow(self: &Arc<Self>, pow: f64) -> Result<(), WhisperError> {
        if !pow.is_finite() || pow < 0.0 {
            return Err(WhisperError::InvalidPow);
        }
        *self.params.min_pow.write() = pow;

        self.gossip.send_whisper_status(WhisperStatus {
            origin: String::new(),
            id: 0,
            code: POW_REQUIREMENT_CODE,
            bloom: Vec::new(),
            pow,
        });

        let whisper = Arc::clone(self);
        tokio::spawn(async move {
            sleep(std::time::Duration::from_secs(DEFAULT_SYNC_ALLOWANCE as u64)).await;
            *whisper.params.min_pow_tolerated.write() = pow;
        });
        Ok(())
    }

    /// Replaces the subscription bloom and advertises it; the old value
    /// stays tolerated for the sync allowance.
    pub fn set_bloom(self: &Arc<Self>, bloom: Bloom) {
        let previous = {
            let mut current = self.params.bloom.write();
            std::mem::replace(&mut *current, bloom)
        };

        self.gossip.send_whisper_status(WhisperStatus {
            origin: String::new(),
            id: 0,
            code: BLOOM_FILTER_EX_CODE,
            bloom: bloom.to_vec(),
            pow: 0.0,
        });

        let whisper = Arc::clone(self);
        tokio::spawn(async move {
            *whisper.params.bloom_tolerated.write() = Some(previous);
            sleep(std::time::Duration::from_secs(DEFAULT_SYNC_ALLOWANCE as u64)).await;
            *whisper.params.bloom_tolerated.write() = Some(bloom);
        });
    }

    /// Widens the local bloom to cover a new filter's topics.
    fn absorb_filter_topics(self: &Arc<Self>, topics: &[Topic]) {
        let mut aggregate = empty_bloom();
        for topic in topics {
            aggregate = bloom_aggregate(&aggregate, &topic.bloom());
        }
        let current = self.bloom();
        if !bloom_covers(&current, &aggregate) {
            self.set_bloom(bloom_aggregate(&current, &aggregate));
        }
    }

    // -- local API ----------------------------------------------------------

    /// Encrypts, mines and injects a new message. Returns the envelope
    /// hash on success.
    pub async fn post_message(self: &Arc<Self>, message: NewMessage) -> Result<[u8; 32], WhisperError> {
        let has_sym = message.sym_key_id.is_some();
        let has_pub = message.public_key.is_some();
        if has_sym && has_pub {
            return Err(WhisperError::AmbiguousKey);
        }

        let key = if let Some(id) = &message.sym_key_id {
            if message.topic == Topic::default() {
                return Err(WhisperError::MissingTopic);
            }
            Some(MessageKey::Symmetric(self.keys.symmetric_key(id)?))
        } else if let Some(bytes) = &message.public_key {
            let public = k256::PublicKey::from_sec1_bytes(bytes)
                .map_err(|_| CryptoError::InvalidPublicKey)?;
            Some(MessageKey::Asymmetric(public))
        } else {
            None
        };

        let params = MessageParams {
            key,
            topic: message.topic,
            pow_time: message.pow_time,
            ttl: if message.ttl == 0 {
                DEFAULT_TTL
            } else {
                message.ttl
            },
            payload: message.payload,
        };

        // Mining is CPU-bound; keep it off the async workers.
        let pow_time = message.pow_time;
        let envelope = tokio::task::spawn_blocking(move || {
            let mut envelope = params.build_envelope()?;
            envelope.mine(pow_time);
            Ok::<Envelope, CryptoError>(envelope)
        })
        .await
        .map_err(|_| WhisperError::MiningFailed)??;

        let hash = envelope.hash();
        self.handle_envelope(envelope, self.conn.own_addr())?;
        debug!(hash = %hex::encode(hash), "posted whisper envelope");
        Ok(hash)
    }

    /// Creates a subscription and widens the local bloom accordingly.
    pub fn new_filter(self: &Arc<Self>, options: FilterOptions) -> Result<String, WhisperError> {
        let has_sym = options.sym_key_id.is_some();
        let has_priv = options.private_key_id.is_some();
        if has_sym && has_priv {
            return Err(WhisperError::Filter(FilterError::AmbiguousKey));
        }

        let key = if let Some(id) = &options.sym_key_id {
            Some(crate::whisper::crypto::WhisperKey::Symmetric(
                self.keys.symmetric_key(id)?,
            ))
        } else if let Some(id) = &options.private_key_id {
            Some(crate::whisper::crypto::WhisperKey::Keypair(
                self.keys.private_key(id)?,
            ))
        } else {
            None
        };

        let id = self
            .filters
            .add(Filter::new(key, options.min_pow, options.topics.clone()))?;
        self.absorb_filter_topics(&options.topics);
        debug!(filter = %id, "created whisper filter");
        Ok(id)
    }

    /// Drains the inbox of a subscription.
    pub fn filter_messages(&self, id: &str) -> Result<Vec<ReceivedMessage>, WhisperError> {
        let filter = self.filters.get(id).ok_or(WhisperError::UnknownFilter)?;
        Ok(filter.take_messages())
    }

    /// Removes a subscription. The bloom is left as-is; it only ever
    /// widens, and peers tolerate over-subscription.
    pub fn remove_filter(&self, id: &str) -> bool {
        self.filters.remove(id)
    }

    // -- intake -------------------------------------------------------------

    fn blacklisted(&self, peer: SocketAddr) -> bool {
        self.blacklist.read().contains(&peer)
    }

    /// Handles an envelope carrier packet from a peer.
    pub fn handle_packet(self: &Arc<Self>, packet: WhisperPacket, sender: SocketAddr) {
        if self.blacklisted(sender) {
            return;
        }
        if packet.code != MESSAGES_CODE {
            return;
        }

        let envelope: Envelope = match bincode::deserialize(&packet.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%sender, error = %err, "malformed envelope, blacklisting peer");
                self.blacklist.write().insert(sender);
                return;
            }
        };

        if let Err(err) = self.handle_envelope(envelope, sender) {
            warn!(%sender, error = %err, "bad envelope, blacklisting peer");
            self.blacklist.write().insert(sender);
        }
    }

    /// Handles a Whisper status advertisement from a peer: applies it to
    /// the relay table and lets the gossip layer spread it.
    pub async fn handle_status(self: &Arc<Self>, status: WhisperStatus, sender: SocketAddr) {
        if self.blacklisted(sender) {
            return;
        }
        self.peer_table.update(&status, sender);
        let origin = status.origin.clone();
        let id = status.id;
        self.gossip
            .handle_gossip(GossipPacket::WhisperStatus(status), &origin, id, sender)
            .await;
    }

    /// The envelope intake. Checks run in a fixed order; a failing
    /// envelope is still admitted when another peer would accept it.
    pub fn handle_envelope(
        &self,
        envelope: Envelope,
        origin: SocketAddr,
    ) -> Result<(), EnvelopeError> {
        let now = unix_now();
        let sent = envelope.sent_time();
        let bloom = envelope.bloom();

        let mut rejection: Option<EnvelopeError> = None;
        let mut diff = 0;

        if sent > now {
            if sent > now.saturating_add(DEFAULT_SYNC_ALLOWANCE) {
                rejection = Some(EnvelopeError::FromTheFuture);
            } else {
                // Tolerated skew: evaluate the PoW as the sender will
                // once the clocks agree.
                diff = sent - now + 1;
            }
        }

        if envelope.expired(now) {
            if envelope.expiry.saturating_add(2 * DEFAULT_SYNC_ALLOWANCE) < now {
                rejection = Some(EnvelopeError::VeryOld);
            } else {
                debug!("expired envelope admitted within the allowance");
            }
        }

        if envelope.size() as u32 > MAX_MESSAGE_SIZE {
            rejection = Some(EnvelopeError::Oversize);
        }

        let pow = envelope.pow(diff);
        if pow < self.min_pow() && pow < *self.params.min_pow_tolerated.read() {
            rejection = Some(EnvelopeError::LowPow);
        }

        if !bloom_covers(&self.bloom(), &bloom) {
            let tolerated_ok = self
                .params
                .bloom_tolerated
                .read()
                .map(|tolerated| bloom_covers(&tolerated, &bloom))
                .unwrap_or(false);
            if !tolerated_ok {
                rejection = Some(EnvelopeError::BloomMismatch);
            }
        }

        if let Some(error) = rejection {
            if !self.peer_table.any_interested(origin, &bloom, pow) {
                return Err(error);
            }
            debug!(error = %error, "admitting envelope for peer relay");
        }

        let hash = envelope.hash();
        let entry = EnvelopeEntry {
            envelope,
            pow,
            bloom,
            origin,
            hash,
        };

        let mut envelopes = self.envelopes.write();
        if !envelopes.contains_key(&hash) {
            envelopes.insert(hash, entry.clone());
            if self.queue_tx.try_send(entry).is_err() {
                debug!("subscriber queue full, envelope not delivered locally");
            }
        }
        Ok(())
    }

    /// The cached envelope under a hash, if any.
    pub fn envelope(&self, hash: &[u8; 32]) -> Option<EnvelopeEntry> {
        self.envelopes.read().get(hash).cloned()
    }

    /// Number of cached envelopes.
    pub fn envelope_count(&self) -> usize {
        self.envelopes.read().len()
    }

    // -- relay --------------------------------------------------------------

    /// Relays one envelope to every interested peer except its origin.
    async fn forward_envelope(&self, entry: &EnvelopeEntry) {
        let Ok(payload) = bincode::serialize(&entry.envelope) else {
            return;
        };
        let packet = GossipPacket::Whisper(WhisperPacket {
            code: MESSAGES_CODE,
            size: payload.len() as u32,
            payload,
        });

        for (peer, params) in self.peer_table.snapshot() {
            if peer != entry.origin && params.accepts(&entry.bloom, entry.pow) {
                self.conn.send(&packet, peer).await;
            }
        }
    }

    // -- workers ------------------------------------------------------------

    /// Stops every Whisper worker.
    pub fn stop(&self) {
        let _ = self.quit.send(());
    }

    /// Delivers admitted envelopes to subscribers until shutdown.
    pub async fn run_queue(self: Arc<Self>) {
        let Some(mut queue) = self.queue_rx.lock().take() else {
            return;
        };
        let mut quit = self.quit.subscribe();
        loop {
            tokio::select! {
                entry = queue.recv() => match entry {
                    Some(entry) => self.filters.notify(&entry.envelope, entry.pow),
                    None => return,
                },
                _ = quit.recv() => return,
            }
        }
    }

    /// Periodic re-broadcast and expiry purge.
    pub async fn run_envelope_maintenance(self: Arc<Self>) {
        let mut transmit = interval(BROADCAST_TIMER);
        let mut expire = interval(EXPIRATION_TIMER);
        let mut quit = self.quit.subscribe();
        loop {
            tokio::select! {
                _ = transmit.tick() => {
                    let now = unix_now();
                    let live: Vec<EnvelopeEntry> = self
                        .envelopes
                        .read()
                        .values()
                        .filter(|entry| !entry.envelope.expired(now))
                        .cloned()
                        .collect();
                    for entry in live {
                        self.forward_envelope(&entry).await;
                    }
                }
                _ = expire.tick() => {
                    let now = unix_now();
                    self.envelopes.write().retain(|_, entry| !entry.envelope.expired(now));
                }
                _ = quit.recv() => return,
            }
        }
    }

    /// Periodic status advertisement; the first one goes out immediately.
    pub async fn run_status(self: Arc<Self>) {
        let mut ticker = interval(STATUS_TIMER);
        let mut quit = self.quit.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.gossip.send_whisper_status(WhisperStatus {
                        origin: String::new(),
                        id: 0,
                        code: STATUS_CODE,
                        bloom: self.bloom().to_vec(),
                        pow: self.min_pow(),
                    });
                }
                _ = quit.recv() => return,
            }
        }
    }
}
