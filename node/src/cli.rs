//! # CLI Interface
//!
//! Defines the command-line surface of `murmur-node` using `clap` derive.
//! The flags mirror the deployed fleet's launcher scripts, so names and
//! defaults are part of the external interface.

use clap::Parser;

/// Murmur gossip overlay node.
///
/// Runs the full peer-to-peer engine: rumor gossip, DSDV routing, chunked
/// file sharing with keyword search, TLC/QSC consensus over file-publish
/// transactions, and the Whisper dark-messaging overlay.
#[derive(Parser, Debug)]
#[command(name = "murmur-node", about = "Murmur gossip overlay node", version)]
pub struct MurmurNodeCli {
    /// Name of the node. Must be unique across the network.
    #[arg(long)]
    pub name: String,

    /// ip:port the gossip (peer-facing) socket binds to.
    #[arg(long = "gossip-addr", default_value = "127.0.0.1:5000")]
    pub gossip_addr: String,

    /// Port of the loopback client socket.
    #[arg(long = "ui-port", default_value = "8080")]
    pub ui_port: String,

    /// Comma separated list of initial peers of the form ip:port.
    #[arg(long, default_value = "")]
    pub peers: String,

    /// Total number of peers in the network, used by consensus majorities.
    #[arg(short = 'N', long = "num-peers", default_value_t = 1)]
    pub num_peers: u64,

    /// Run in legacy broadcast-only mode.
    #[arg(long, default_value_t = false)]
    pub simple: bool,

    /// Publish file transactions with gossip-with-confirmation.
    #[arg(long, default_value_t = false)]
    pub hw3ex2: bool,

    /// Enable round-based gossiping (TLC). Implies --hw3ex2.
    #[arg(long, default_value_t = false)]
    pub hw3ex3: bool,

    /// Enable consensus agreement (QSC). Implies --hw3ex3.
    #[arg(long, default_value_t = false)]
    pub hw3ex4: bool,

    /// Ack every TLC message regardless of its round.
    #[arg(long = "ack-all", default_value_t = false)]
    pub ack_all: bool,

    /// Anti-entropy period in seconds. Zero disables it.
    #[arg(long = "anti-entropy", default_value_t = 5)]
    pub anti_entropy: u64,

    /// Route-rumor period in seconds. Zero disables it.
    #[arg(long, default_value_t = 0)]
    pub rtimer: u64,

    /// Stubborn re-broadcast period for unconfirmed blocks, in seconds.
    #[arg(long = "stubborn-timeout", default_value_t = 10)]
    pub stubborn_timeout: u64,

    /// Hop limit for point-to-point packets.
    #[arg(long = "hop-limit", default_value_t = 10)]
    pub hop_limit: u32,

    /// Default log level when RUST_LOG is not set.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}
