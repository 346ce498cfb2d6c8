//! # UDP Transport
//!
//! Thin wrapper around the node's two UDP sockets: the peer-facing gossip
//! socket and the loopback client socket. All outbound traffic flows
//! through [`ConnectionHandler::send`]; encode failures and transport
//! errors are logged and the datagram is dropped — the gossip layer
//! recovers lost datagrams through anti-entropy.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::warn;

use crate::packet::{self, GossipPacket};

/// Transport-layer errors. Callers generally log and continue.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
}

/// The node's sockets plus its resolved gossip address.
pub struct ConnectionHandler {
    gossip_socket: Arc<UdpSocket>,
    client_socket: Arc<UdpSocket>,
    own_addr: SocketAddr,
}

impl ConnectionHandler {
    /// Binds both sockets.
    pub async fn bind(
        gossip_addr: SocketAddr,
        client_addr: SocketAddr,
    ) -> Result<Self, TransportError> {
        let gossip_socket = UdpSocket::bind(gossip_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: gossip_addr,
                source,
            })?;
        let client_socket = UdpSocket::bind(client_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: client_addr,
                source,
            })?;

        // The bound address, so an OS-assigned port is reflected.
        let own_addr = gossip_socket.local_addr().unwrap_or(gossip_addr);

        Ok(Self {
            gossip_socket: Arc::new(gossip_socket),
            client_socket: Arc::new(client_socket),
            own_addr,
        })
    }

    /// The gossip socket's bound address. Used as the node's peer identity.
    pub fn own_addr(&self) -> SocketAddr {
        self.own_addr
    }

    /// Handle to the gossip socket for the read loop.
    pub fn gossip_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.gossip_socket)
    }

    /// Handle to the client socket for the read loop.
    pub fn client_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.client_socket)
    }

    /// Encodes and sends one packet to one peer. Failures are logged and
    /// swallowed; the retry/anti-entropy machinery handles the loss.
    pub async fn send(&self, packet: &GossipPacket, to: SocketAddr) {
        let bytes = match packet::encode(packet) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%to, error = %err, "dropping unencodable packet");
                return;
            }
        };
        if let Err(err) = self.gossip_socket.send_to(&bytes, to).await {
            warn!(%to, error = %err, "UDP send failed");
        }
    }

    /// Sends a packet to every peer in `peers` except `exclude`.
    pub async fn broadcast(
        &self,
        packet: &GossipPacket,
        peers: &[SocketAddr],
        exclude: Option<SocketAddr>,
    ) {
        for peer in peers {
            if Some(*peer) != exclude {
                self.send(packet, *peer).await;
            }
        }
    }
}
