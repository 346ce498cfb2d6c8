// Copyright (c) 2026 Murmur Contributors. MIT License.
// See LICENSE for details.

//! # Murmur Node
//!
//! Entry point for the `murmur-node` binary: parses the CLI surface,
//! initializes logging, builds the immutable node configuration, starts
//! the protocol runtime and then parks until the process is terminated.

mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;

use murmur_protocol::config::NodeConfig;
use murmur_protocol::node::Node;

use cli::MurmurNodeCli;
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let args = MurmurNodeCli::parse();

    let log_filter = format!(
        "murmur_node={level},murmur_protocol={level}",
        level = args.log_level
    );
    logging::init_logging(&log_filter, LogFormat::Pretty);

    let gossip_addr: SocketAddr = args
        .gossip_addr
        .parse()
        .with_context(|| format!("invalid gossip address: {}", args.gossip_addr))?;
    let client_addr: SocketAddr = format!("127.0.0.1:{}", args.ui_port)
        .parse()
        .with_context(|| format!("invalid client port: {}", args.ui_port))?;

    // Unresolvable peers are skipped, matching the launcher scripts that
    // pass placeholder entries for nodes joining later.
    let peers: Vec<SocketAddr> = args
        .peers
        .split(',')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse() {
            Ok(addr) => Some(addr),
            Err(err) => {
                tracing::warn!(peer = entry, error = %err, "skipping unresolvable peer");
                None
            }
        })
        .collect();

    let base_dir = std::env::current_dir().context("cannot resolve working directory")?;

    let config = NodeConfig::new(
        args.name,
        gossip_addr,
        client_addr,
        peers,
        args.num_peers,
        args.simple,
        args.hw3ex2,
        args.hw3ex3,
        args.hw3ex4,
        args.ack_all,
        args.hop_limit,
        args.anti_entropy,
        args.rtimer,
        args.stubborn_timeout,
        base_dir,
    );

    let node = Node::new(config, None)
        .await
        .context("failed to start node")?;
    node.start();

    tracing::info!(
        name = %node.name(),
        gossip = %node.gossip_addr(),
        "node running"
    );

    // The node runs until terminated; Ctrl-C stops the Whisper workers
    // and exits cleanly.
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    node.stop();
    tracing::info!("node stopped");
    Ok(())
}
