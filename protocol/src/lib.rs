// Copyright (c) 2026 Murmur Contributors. MIT License.
// See LICENSE for details.

//! # Murmur Protocol — Core Library
//!
//! The distributed-systems engine of a Murmur node: a peer-to-peer
//! overlay speaking a tagged packet union over UDP and offering three
//! tightly coupled services plus a dark-messaging layer:
//!
//! - **gossip** — epidemic rumor dissemination with anti-entropy, vector
//!   clocks and coin-flip mongering.
//! - **routing** — DSDV next-hop tracking and point-to-point forwarding
//!   for private messages, data transfers, search replies and acks.
//! - **files** — content-addressed chunking, chunked downloads and
//!   budgeted keyword search.
//! - **consensus** — TLC round-based gossip-with-confirmation and the
//!   QSC three-round best-fitness chain of file-publish transactions.
//! - **whisper** — PoW-stamped encrypted envelopes relayed along bloom
//!   filter advertisements to topic subscribers.
//!
//! The [`node::Node`] runtime binds the sockets, owns one bounded queue
//! per packet kind, and wires every engine together. The host binary only
//! parses the CLI, initializes logging and starts the runtime.

pub mod config;
pub mod consensus;
pub mod events;
pub mod files;
pub mod gossip;
pub mod node;
pub mod output;
pub mod packet;
pub mod peers;
pub mod routing;
pub mod transport;
pub mod whisper;
