//! # Whisper Overlay
//!
//! Dark messaging on top of the gossip overlay: proof-of-work stamped,
//! optionally encrypted envelopes addressed by 4-byte topics, relayed
//! along peers' advertised bloom filters and PoW requirements, and
//! delivered to local subscribers through topic filters.

pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod filter;
pub mod message;
pub mod routing;
pub mod topic;

pub use engine::{FilterOptions, NewMessage, Whisper};
pub use envelope::Envelope;
pub use filter::Filter;
pub use message::ReceivedMessage;
pub use topic::{Bloom, Topic};

use std::time::{SystemTime, UNIX_EPOCH};

/// Whisper status code: full parameter advertisement.
pub const STATUS_CODE: u32 = 0;
/// Whisper packet code: envelope payload.
pub const MESSAGES_CODE: u32 = 1;
/// Whisper status code: PoW requirement update.
pub const POW_REQUIREMENT_CODE: u32 = 2;
/// Whisper status code: bloom filter update.
pub const BLOOM_FILTER_EX_CODE: u32 = 3;

/// Current unix time in seconds, clamped into the u32 the wire carries.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}
