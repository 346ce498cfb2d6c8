//! # Protocol Configuration & Constants
//!
//! Every magic number in Murmur lives here. The values mirror the deployed
//! network: changing a timer or a threshold on one node desynchronizes it
//! from every peer that still runs the stock parameters.
//!
//! Runtime-tunable knobs (timers, hop limit, operating mode) are collected
//! in [`NodeConfig`], an immutable record built once at startup from the
//! CLI surface and passed by handle to every worker.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Initial UDP receive buffer size in bytes. A datagram that fills the
/// buffer completely is treated as truncated: the buffer grows and the
/// datagram is skipped.
pub const MAX_BUFFER_SIZE: usize = 60_000;

/// Capacity of every per-kind packet queue.
pub const CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Gossip Timers
// ---------------------------------------------------------------------------

/// How long a mongering attempt waits for a status from the chosen peer.
pub const RUMOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Default anti-entropy period. The first status exchange fires
/// immediately on startup.
pub const DEFAULT_ANTI_ENTROPY_SECS: u64 = 5;

/// Default period for re-mongering an unconfirmed TLC message.
pub const DEFAULT_STUBBORN_TIMEOUT_SECS: u64 = 10;

/// Delay before a causally premature confirmed TLC message is re-enqueued.
pub const TLC_QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Point-to-Point
// ---------------------------------------------------------------------------

/// Default hop limit for point-to-point packets (private messages, data
/// requests/replies, search replies, TLC acks).
pub const DEFAULT_HOP_LIMIT: u32 = 10;

// ---------------------------------------------------------------------------
// File Transfer
// ---------------------------------------------------------------------------

/// Fixed chunk size for file indexing. The metafile is the concatenation
/// of the 32-byte SHA-256 digests of these chunks.
pub const FILE_CHUNK_SIZE: usize = 8192;

/// How long a chunk request waits before being re-sent.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A chunk download gives up after this many request periods.
pub const REQUEST_HARD_STOP_FACTOR: u32 = 10;

/// Directory (relative to the working directory) scanned for files to index.
pub const SHARE_DIR: &str = "_SharedFiles";

/// Directory (relative to the working directory) reconstructed files are
/// written to.
pub const DOWNLOAD_DIR: &str = "_Downloads";

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Budget assigned to a search when the client does not specify one.
/// Doubles on every tick until [`MAX_SEARCH_BUDGET`].
pub const DEFAULT_SEARCH_BUDGET: u64 = 2;

/// Ceiling for the doubling search budget.
pub const MAX_SEARCH_BUDGET: u64 = 32;

/// Period of the search budget-doubling / termination check.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of distinct fully-locatable matches that finishes a search.
pub const SEARCH_MATCH_THRESHOLD: usize = 2;

/// Window in which a repeated (origin, keywords) search request is dropped.
pub const SEARCH_REQUEST_DUPLICATE_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// UI Feeds
// ---------------------------------------------------------------------------

/// Capacity of the latest-rumors feed consumed by the viewer.
pub const LATEST_MESSAGES_BUFFER: usize = 30;

// ---------------------------------------------------------------------------
// Whisper
// ---------------------------------------------------------------------------

/// Topic tag length in bytes.
pub const TOPIC_LENGTH: usize = 4;

/// Symmetric key length: AES-256.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes, prepended to the ciphertext.
pub const AES_NONCE_LENGTH: usize = 12;

/// Length in bytes of the random identifiers handed out for keys and filters.
pub const KEY_ID_SIZE: usize = 32;

/// Bloom filter length in bytes (512 bits).
pub const BLOOM_FILTER_SIZE: usize = 64;

/// Hard upper bound on an envelope's encoded size.
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Default per-node envelope size limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Default minimum proof-of-work demanded of incoming envelopes.
pub const DEFAULT_MIN_POW: f64 = 0.2;

/// Default envelope time-to-live in seconds.
pub const DEFAULT_TTL: u32 = 50;

/// Clock skew tolerated between peers, in seconds. Old parameter values
/// stay accepted for this long after a bloom or PoW update.
pub const DEFAULT_SYNC_ALLOWANCE: u32 = 10;

/// Encrypted payloads are padded to a multiple of this size.
pub const PAD_SIZE_LIMIT: usize = 256;

/// Capacity of the subscriber-notification queue.
pub const MESSAGE_QUEUE_LIMIT: usize = 1024;

/// Period of the expired-envelope purge.
pub const EXPIRATION_TIMER: Duration = Duration::from_secs(3);

/// Period of the envelope re-broadcast pass.
pub const BROADCAST_TIMER: Duration = Duration::from_secs(1);

/// Period of the Whisper status advertisement.
pub const STATUS_TIMER: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Immutable per-node configuration, constructed once from the CLI surface.
///
/// Flag composition is resolved in [`NodeConfig::new`]: `hw3ex4` implies
/// `hw3ex3`, and `hw3ex3` implies gossip-with-confirmation (`hw3ex2`).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable origin name of this node. Unique across the network.
    pub name: String,
    /// Address the gossip (peer-facing) UDP socket binds to.
    pub gossip_addr: SocketAddr,
    /// Address the client (loopback) UDP socket binds to.
    pub client_addr: SocketAddr,
    /// Initial peer endpoints.
    pub peers: Vec<SocketAddr>,
    /// Total number of peers in the network (`N`), used by consensus
    /// majorities. With `N <= 1` consensus is trivially reached by the
    /// sole node.
    pub total_peers: u64,
    /// Legacy broadcast-only mode.
    pub simple: bool,
    /// Publish file transactions via gossip-with-confirmation.
    pub hw3ex2: bool,
    /// Round-based gossiping (TLC).
    pub hw3ex3: bool,
    /// Consensus agreement (QSC).
    pub hw3ex4: bool,
    /// Ack every TLC message regardless of its round.
    pub ack_all: bool,
    /// Hop limit for point-to-point packets.
    pub hop_limit: u32,
    /// Anti-entropy period in seconds. Zero disables the timer.
    pub anti_entropy_secs: u64,
    /// Route-rumor period in seconds. Zero disables the timer.
    pub route_timer_secs: u64,
    /// Stubborn re-broadcast period in seconds. Zero disables
    /// gossip-with-confirmation retries.
    pub stubborn_timeout_secs: u64,
    /// Directory scanned for files to index.
    pub share_dir: PathBuf,
    /// Directory reconstructed files are written to.
    pub download_dir: PathBuf,
}

impl NodeConfig {
    /// Builds a config record, resolving flag implications and anchoring
    /// the share/download directories under `base_dir`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        gossip_addr: SocketAddr,
        client_addr: SocketAddr,
        peers: Vec<SocketAddr>,
        total_peers: u64,
        simple: bool,
        hw3ex2: bool,
        hw3ex3: bool,
        hw3ex4: bool,
        ack_all: bool,
        hop_limit: u32,
        anti_entropy_secs: u64,
        route_timer_secs: u64,
        stubborn_timeout_secs: u64,
        base_dir: PathBuf,
    ) -> Self {
        let hw3ex3 = hw3ex3 || hw3ex4;
        let hw3ex2 = hw3ex2 || hw3ex3;

        Self {
            name,
            gossip_addr,
            client_addr,
            peers,
            total_peers,
            simple,
            hw3ex2,
            hw3ex3,
            hw3ex4,
            ack_all,
            hop_limit,
            anti_entropy_secs,
            route_timer_secs,
            stubborn_timeout_secs,
            share_dir: base_dir.join(SHARE_DIR),
            download_dir: base_dir.join(DOWNLOAD_DIR),
        }
    }

    /// True when the node publishes file transactions through
    /// gossip-with-confirmation (any of the three consensus modes).
    pub fn publishes_tx_blocks(&self) -> bool {
        self.hw3ex2 || self.hw3ex3 || self.hw3ex4
    }

    /// Strict-majority threshold over the `N` parameter: a set of distinct
    /// origins wins when its size exceeds `N / 2`.
    pub fn majority(&self, count: usize) -> bool {
        count > (self.total_peers / 2) as usize
    }
}
