//! # Topics & Bloom Filters
//!
//! A topic is a 4-byte tag. Subscriptions are advertised as 512-bit bloom
//! filters: each topic sets three bits, whose 9-bit indices are derived
//! from the first three topic bytes plus one spreading bit each from the
//! fourth byte.

use serde::{Deserialize, Serialize};

use crate::config::{BLOOM_FILTER_SIZE, TOPIC_LENGTH};

/// 512-bit subscription advertisement.
pub type Bloom = [u8; BLOOM_FILTER_SIZE];

/// A 4-byte message category tag.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Topic(pub [u8; TOPIC_LENGTH]);

impl Topic {
    /// Builds a topic from the first four bytes of `bytes`, zero-padding
    /// shorter input.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut topic = [0u8; TOPIC_LENGTH];
        for (slot, byte) in topic.iter_mut().zip(bytes) {
            *slot = *byte;
        }
        Topic(topic)
    }

    /// The bloom filter with exactly this topic's three bits set.
    ///
    /// For j in 0..3 the bit index is `topic[j] + 256 * bit_j(topic[3])`.
    pub fn bloom(&self) -> Bloom {
        let mut bloom = [0u8; BLOOM_FILTER_SIZE];
        for j in 0..3 {
            let mut index = self.0[j] as usize;
            if self.0[3] & (1 << j) != 0 {
                index += 256;
            }
            bloom[index / 8] |= 1 << (index % 8);
        }
        bloom
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// True iff every bit of `given` is also set in `filter` — the filter
/// covers the advertisement.
pub fn bloom_covers(filter: &Bloom, given: &Bloom) -> bool {
    filter
        .iter()
        .zip(given.iter())
        .all(|(f, g)| (f | g) == *f)
}

/// Bitwise OR of two bloom filters.
pub fn bloom_aggregate(a: &Bloom, b: &Bloom) -> Bloom {
    let mut merged = [0u8; BLOOM_FILTER_SIZE];
    for (slot, (x, y)) in merged.iter_mut().zip(a.iter().zip(b.iter())) {
        *slot = x | y;
    }
    merged
}

/// The all-zero filter: subscribes to nothing, covers nothing but itself.
pub fn empty_bloom() -> Bloom {
    [0u8; BLOOM_FILTER_SIZE]
}

/// Converts a wire-carried filter into the fixed-size form, rejecting
/// wrong lengths.
pub fn bloom_from_slice(bytes: &[u8]) -> Option<Bloom> {
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_sets_exactly_three_bits_or_fewer() {
        let topic = Topic::from_bytes(b"abcd");
        let bloom = topic.bloom();
        let bits: u32 = bloom.iter().map(|byte| byte.count_ones()).sum();
        // Three derived indices; collisions can only lower the count.
        assert!(bits >= 1 && bits <= 3);
    }

    #[test]
    fn fourth_byte_spreads_indices() {
        let low = Topic([1, 2, 3, 0]).bloom();
        let high = Topic([1, 2, 3, 0b0000_0111]).bloom();
        assert_ne!(low, high);

        // With bit j of topic[3] set, index j moves into the upper half.
        let upper_half_bits: u32 = high[32..].iter().map(|byte| byte.count_ones()).sum();
        assert_eq!(upper_half_bits, 3);
    }

    #[test]
    fn bloom_covers_is_subset_semantics() {
        let a = Topic::from_bytes(b"aaaa").bloom();
        let b = Topic::from_bytes(b"bbbb").bloom();
        let both = bloom_aggregate(&a, &b);

        assert!(bloom_covers(&both, &a));
        assert!(bloom_covers(&both, &b));
        assert!(!bloom_covers(&a, &b));
        assert!(bloom_covers(&a, &empty_bloom()));
        assert!(!bloom_covers(&empty_bloom(), &a));
    }

    #[test]
    fn aggregate_is_commutative_and_idempotent() {
        let a = Topic::from_bytes(b"one!").bloom();
        let b = Topic::from_bytes(b"two!").bloom();
        assert_eq!(bloom_aggregate(&a, &b), bloom_aggregate(&b, &a));
        assert_eq!(bloom_aggregate(&a, &a), a);
    }

    #[test]
    fn short_topic_bytes_are_zero_padded() {
        assert_eq!(Topic::from_bytes(b"ab"), Topic([b'a', b'b', 0, 0]));
        assert_eq!(Topic::from_bytes(b"abcdef"), Topic(*b"abcd"));
    }

    #[test]
    fn wire_round_trip_of_bloom_length() {
        let bloom = Topic::from_bytes(b"wire").bloom();
        assert!(bloom_from_slice(&bloom[..]).is_some());
        assert!(bloom_from_slice(&bloom[..63]).is_none());
    }
}
