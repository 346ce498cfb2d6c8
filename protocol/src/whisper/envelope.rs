//! # Envelopes & Proof-of-Work
//!
//! An envelope is the unit of Whisper traffic: expiry, TTL, topic, an
//! opaque (usually encrypted) data blob, and a nonce. The nonce is mined
//! so that `SHA3-256(encode(expiry, ttl, topic, data) || BE64(nonce))`
//! has many leading zero bits; the PoW score normalizes that work by the
//! envelope size and lifetime:
//!
//! ```text
//! pow = 2^leading_zeros / (size_bytes * (ttl + diff))
//! ```
//!
//! Mining runs for a fixed wall-clock budget and keeps the best nonce
//! found. The expiry is extended by the mining budget up front, so
//! receivers that recompute the score at arrival see a consistent value.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::time::{Duration, Instant};

use crate::whisper::topic::{Bloom, Topic};
use crate::whisper::unix_now;

/// A Whisper envelope as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unix second after which the envelope is purged.
    pub expiry: u32,
    /// Lifetime in seconds. `expiry - ttl` is the send time.
    pub ttl: u32,
    /// Addressing tag.
    pub topic: Topic,
    /// Payload: padded plaintext, AES-GCM ciphertext, or ECIES ciphertext.
    pub data: Vec<u8>,
    /// Mined proof-of-work nonce.
    pub nonce: u64,
}

impl Envelope {
    /// Creates an unmined envelope expiring `ttl` seconds from now.
    pub fn new(ttl: u32, topic: Topic, data: Vec<u8>) -> Self {
        Self {
            expiry: unix_now().saturating_add(ttl),
            ttl,
            topic,
            data,
            nonce: 0,
        }
    }

    /// Encoded wire size of the envelope.
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }

    /// SHA3-256 of the encoded envelope; the cache/dedup identity.
    pub fn hash(&self) -> [u8; 32] {
        let encoded = bincode::serialize(self).unwrap_or_default();
        Sha3_256::digest(&encoded).into()
    }

    /// The bloom advertisement of the envelope's topic.
    pub fn bloom(&self) -> Bloom {
        self.topic.bloom()
    }

    /// The PoW preimage without the nonce.
    fn pow_base(&self) -> Vec<u8> {
        bincode::serialize(&(self.expiry, self.ttl, self.topic, &self.data)).unwrap_or_default()
    }

    /// PoW score of the current nonce. `diff` widens the effective
    /// lifetime — receivers tolerating clock skew pass `sent - now + 1`.
    pub fn pow(&self, diff: u32) -> f64 {
        let mut preimage = self.pow_base();
        preimage.extend_from_slice(&self.nonce.to_be_bytes());
        let digest: [u8; 32] = Sha3_256::digest(&preimage).into();
        let zeros = leading_zero_bits(&digest);

        let denominator = self.size() as f64 * (self.ttl.saturating_add(diff)) as f64;
        if denominator == 0.0 {
            return 0.0;
        }
        2f64.powi(zeros as i32) / denominator
    }

    /// Mines the nonce for `pow_time` seconds, keeping the best found.
    /// Extends the expiry by the mining budget first. CPU-bound: run it
    /// under `spawn_blocking`.
    pub fn mine(&mut self, pow_time: u32) {
        self.expiry = self.expiry.saturating_add(pow_time);

        let base = self.pow_base();
        let mut preimage = base.clone();
        preimage.extend_from_slice(&[0u8; 8]);
        let nonce_offset = base.len();

        let deadline = Instant::now() + Duration::from_secs(pow_time as u64);
        let mut best_zeros = -1i32;
        let mut nonce = 0u64;

        while Instant::now() < deadline {
            for _ in 0..1024 {
                preimage[nonce_offset..].copy_from_slice(&nonce.to_be_bytes());
                let digest: [u8; 32] = Sha3_256::digest(&preimage).into();
                let zeros = leading_zero_bits(&digest) as i32;
                if zeros > best_zeros {
                    best_zeros = zeros;
                    self.nonce = nonce;
                }
                nonce = nonce.wrapping_add(1);
            }
        }
    }

    /// The unix second the envelope was sent.
    pub fn sent_time(&self) -> u32 {
        self.expiry.saturating_sub(self.ttl)
    }

    /// True once the envelope has outlived its expiry.
    pub fn expired(&self, now: u32) -> bool {
        self.expiry < now
    }
}

/// Number of leading zero bits in a 256-bit digest.
fn leading_zero_bits(digest: &[u8; 32]) -> u32 {
    let mut zeros = 0;
    for byte in digest {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}
