//! # Consensus Layer
//!
//! Round-based agreement on a single linear chain of file-publish
//! transactions: TLC stubborn broadcast with ack-majority confirmation,
//! and the three-round QSC best-fitness decision built on top of it.

pub mod block;
pub mod qsc;
pub mod tlc;

pub use block::{BlockPublish, TxPublish};
pub use tlc::ConsensusEngine;
