//! # Publish Transactions & Blocks
//!
//! The consensus layer commits a single linear chain of file-publish
//! transactions. A [`TxPublish`] claims a file name; a [`BlockPublish`]
//! wraps one transaction and links to its predecessor by hash, back to the
//! all-zero hash that terminates every chain.
//!
//! ## Hash Computation
//!
//! The block hash covers `prev_hash || tx_hash`; the transaction hash
//! covers `u32_le(len(name)) || name || metafile_hash`. Both are SHA-256.
//! The transaction size is deliberately NOT part of the hash — the name
//! claim is what consensus arbitrates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The terminal parent hash of every chain.
pub const ZERO_HASH: [u8; 32] = [0u8; 32];

/// A file-publish transaction: a claim that `name` maps to the file whose
/// metafile hashes to `metafile_hash`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPublish {
    /// Claimed file name. Committed names are unique across the chain.
    pub name: String,
    /// File size in bytes.
    pub size: i64,
    /// SHA-256 of the file's metafile.
    pub metafile_hash: Vec<u8>,
}

impl TxPublish {
    /// SHA-256 over the length-prefixed name and the metafile hash.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.name.len() as u32).to_le_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(&self.metafile_hash);
        hasher.finalize().into()
    }
}

/// One block of the publish chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPublish {
    /// Hash of the preceding block; [`ZERO_HASH`] for the first block.
    pub prev_hash: [u8; 32],
    /// The single transaction this block commits.
    pub transaction: TxPublish,
}

impl BlockPublish {
    /// SHA-256 over the parent link and the transaction hash.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash);
        hasher.update(self.transaction.hash());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tx(name: &str) -> TxPublish {
        TxPublish {
            name: name.to_string(),
            size: 20_000,
            metafile_hash: vec![0xab; 32],
        }
    }

    #[test]
    fn tx_hash_is_deterministic() {
        assert_eq!(make_tx("file.bin").hash(), make_tx("file.bin").hash());
    }

    #[test]
    fn tx_hash_covers_name() {
        assert_ne!(make_tx("a").hash(), make_tx("b").hash());
    }

    #[test]
    fn tx_hash_ignores_size() {
        let mut tx = make_tx("file.bin");
        let before = tx.hash();
        tx.size = 1;
        assert_eq!(tx.hash(), before);
    }

    #[test]
    fn tx_hash_covers_metafile_hash() {
        let mut tx = make_tx("file.bin");
        let before = tx.hash();
        tx.metafile_hash[0] ^= 0xff;
        assert_ne!(tx.hash(), before);
    }

    #[test]
    fn block_hash_covers_parent_link() {
        let first = BlockPublish {
            prev_hash: ZERO_HASH,
            transaction: make_tx("file.bin"),
        };
        let second = BlockPublish {
            prev_hash: first.hash(),
            transaction: make_tx("file.bin"),
        };
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn chain_of_three_links() {
        let b0 = BlockPublish {
            prev_hash: ZERO_HASH,
            transaction: make_tx("one"),
        };
        let b1 = BlockPublish {
            prev_hash: b0.hash(),
            transaction: make_tx("two"),
        };
        let b2 = BlockPublish {
            prev_hash: b1.hash(),
            transaction: make_tx("three"),
        };
        assert_eq!(b2.prev_hash, b1.hash());
        assert_eq!(b1.prev_hash, b0.hash());
        assert_eq!(b0.prev_hash, ZERO_HASH);
    }
}
