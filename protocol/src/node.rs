//! # Node Runtime
//!
//! Wires every engine together: binds the two UDP sockets, demultiplexes
//! incoming datagrams into one bounded queue per packet kind, spawns one
//! worker per kind, runs the periodic timers, and classifies local client
//! requests into protocol actions.
//!
//! Cross-component traffic flows exclusively through these queues; no
//! worker reaches into another component's maps. Apart from the Whisper
//! workers (stopped by the Whisper quit signal) the node runs until the
//! process exits.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, CHANNEL_CAPACITY, DEFAULT_SEARCH_BUDGET, MAX_BUFFER_SIZE};
use crate::consensus::tlc::FitnessSource;
use crate::consensus::ConsensusEngine;
use crate::events::{EventBus, FileEvent};
use crate::files::{FileEngine, SearchEngine, TransferEngine};
use crate::gossip::{GossipEngine, MessageStore};
use crate::output;
use crate::packet::{
    self, ClientIntent, ClientRequest, DataReply, DataRequest, GossipPacket, PrivateMessage,
    SimpleMessage, TlcMessage,
};
use crate::peers::PeerSet;
use crate::routing::{Forwarder, RoutingTable};
use crate::transport::{ConnectionHandler, TransportError};
use crate::whisper::Whisper;

/// Fatal node startup errors. Everything after startup is logged and
/// survived.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to create working directory: {0}")]
    WorkingDirectory(#[source] io::Error),
}

/// Senders of the per-kind packet queues.
#[derive(Clone)]
struct Dispatch {
    simple: mpsc::Sender<(SimpleMessage, SocketAddr)>,
    rumor: mpsc::Sender<(crate::packet::RumorMessage, SocketAddr)>,
    status: mpsc::Sender<(crate::packet::StatusPacket, SocketAddr)>,
    private: mpsc::Sender<(PrivateMessage, SocketAddr)>,
    data_request: mpsc::Sender<(DataRequest, SocketAddr)>,
    data_reply: mpsc::Sender<(DataReply, SocketAddr)>,
    search_request: mpsc::Sender<(crate::packet::SearchRequest, SocketAddr)>,
    search_reply: mpsc::Sender<(crate::packet::SearchReply, SocketAddr)>,
    tlc: mpsc::Sender<(TlcMessage, SocketAddr)>,
    tlc_ack: mpsc::Sender<(crate::packet::TlcAck, SocketAddr)>,
    tlc_causal: mpsc::Sender<(TlcMessage, SocketAddr)>,
    client_block: mpsc::Sender<TlcMessage>,
    whisper_packet: mpsc::Sender<(crate::packet::WhisperPacket, SocketAddr)>,
    whisper_status: mpsc::Sender<(crate::packet::WhisperStatus, SocketAddr)>,
}

/// The assembled node.
pub struct Node {
    config: Arc<NodeConfig>,
    conn: Arc<ConnectionHandler>,
    peers: Arc<PeerSet>,
    routing: Arc<RoutingTable>,
    forwarder: Arc<Forwarder>,
    gossip: Arc<GossipEngine>,
    files: Arc<FileEngine>,
    transfer: Arc<TransferEngine>,
    search: Arc<SearchEngine>,
    consensus: Arc<ConsensusEngine>,
    whisper: Arc<Whisper>,
    events: Arc<EventBus>,
    dispatch: parking_lot::Mutex<Option<Dispatch>>,
}

impl Node {
    /// Binds the sockets, creates the working directories and assembles
    /// every engine. `fitness` overrides the consensus fitness source
    /// (tests inject deterministic values).
    pub async fn new(
        config: NodeConfig,
        fitness: Option<FitnessSource>,
    ) -> Result<Arc<Self>, NodeError> {
        let config = Arc::new(config);

        std::fs::create_dir_all(&config.share_dir).map_err(NodeError::WorkingDirectory)?;
        std::fs::create_dir_all(&config.download_dir).map_err(NodeError::WorkingDirectory)?;

        let conn =
            Arc::new(ConnectionHandler::bind(config.gossip_addr, config.client_addr).await?);
        let peers = Arc::new(PeerSet::new(conn.own_addr(), &config.peers));
        let routing = Arc::new(RoutingTable::new());
        let forwarder = Arc::new(Forwarder::new(Arc::clone(&routing), Arc::clone(&conn)));
        let events = Arc::new(EventBus::new());
        let store = Arc::new(MessageStore::new());

        let gossip = Arc::new(GossipEngine::new(
            Arc::clone(&config),
            Arc::clone(&conn),
            Arc::clone(&peers),
            Arc::clone(&routing),
            store,
            Arc::clone(&events),
        ));
        let files = Arc::new(FileEngine::new(Arc::clone(&config)));
        let transfer = Arc::new(TransferEngine::new(
            Arc::clone(&config),
            Arc::clone(&files),
            Arc::clone(&forwarder),
            Arc::clone(&events),
        ));
        let search = Arc::new(SearchEngine::new(
            Arc::clone(&config),
            Arc::clone(&files),
            Arc::clone(&transfer),
            Arc::clone(&peers),
            Arc::clone(&conn),
            Arc::clone(&forwarder),
            Arc::clone(&events),
        ));
        let consensus = Arc::new(ConsensusEngine::new(
            Arc::clone(&config),
            Arc::clone(&gossip),
            Arc::clone(&forwarder),
            Arc::clone(&events),
            fitness,
        ));
        let whisper = Arc::new(Whisper::new(Arc::clone(&gossip), Arc::clone(&conn)));

        Ok(Arc::new(Self {
            config,
            conn,
            peers,
            routing,
            forwarder,
            gossip,
            files,
            transfer,
            search,
            consensus,
            whisper,
            events,
            dispatch: parking_lot::Mutex::new(None),
        }))
    }

    // -- accessors ----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The node's current consensus round.
    pub fn round(&self) -> u32 {
        self.consensus.my_time()
    }

    /// Origins with a known route, for the viewer.
    pub fn origins(&self) -> Vec<String> {
        self.routing.origins()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn whisper(&self) -> &Arc<Whisper> {
        &self.whisper
    }

    /// The bound gossip endpoint (useful with an OS-assigned port).
    pub fn gossip_addr(&self) -> SocketAddr {
        self.conn.own_addr()
    }

    /// Stops the Whisper workers. Everything else runs until process exit.
    pub fn stop(&self) {
        self.whisper.stop();
    }

    // -- startup ------------------------------------------------------------

    /// Spawns the read loops, the per-kind workers and every timer.
    pub fn start(self: &Arc<Self>) {
        info!(
            name = %self.config.name,
            gossip = %self.conn.own_addr(),
            peers = self.peers.len(),
            "starting node"
        );

        let (simple_tx, simple_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (rumor_tx, rumor_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (private_tx, private_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (data_request_tx, data_request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (data_reply_tx, data_reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (search_request_tx, search_request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (search_reply_tx, search_reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tlc_tx, tlc_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tlc_ack_tx, tlc_ack_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tlc_causal_tx, tlc_causal_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (client_block_tx, client_block_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (whisper_packet_tx, whisper_packet_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (whisper_status_tx, whisper_status_rx) = mpsc::channel(CHANNEL_CAPACITY);

        *self.dispatch.lock() = Some(Dispatch {
            simple: simple_tx,
            rumor: rumor_tx,
            status: status_tx,
            private: private_tx,
            data_request: data_request_tx,
            data_reply: data_reply_tx,
            search_request: search_request_tx,
            search_reply: search_reply_tx,
            tlc: tlc_tx,
            tlc_ack: tlc_ack_tx,
            tlc_causal: tlc_causal_tx.clone(),
            client_block: client_block_tx,
            whisper_packet: whisper_packet_tx,
            whisper_status: whisper_status_tx,
        });

        // Read loops.
        tokio::spawn(Arc::clone(self).run_peer_socket());
        tokio::spawn(Arc::clone(self).run_client_socket());

        // Per-kind workers.
        tokio::spawn(Arc::clone(self).run_simple_worker(simple_rx));
        tokio::spawn(Arc::clone(self).run_rumor_worker(rumor_rx));
        tokio::spawn(Arc::clone(self).run_status_worker(status_rx));
        tokio::spawn(Arc::clone(self).run_private_worker(private_rx));
        tokio::spawn(Arc::clone(self).run_data_request_worker(data_request_rx));
        tokio::spawn(Arc::clone(self).run_data_reply_worker(data_reply_rx));
        tokio::spawn(Arc::clone(self).run_search_request_worker(search_request_rx));
        tokio::spawn(Arc::clone(self).run_search_reply_worker(search_reply_rx));
        tokio::spawn(Arc::clone(self).run_tlc_worker(tlc_rx));
        tokio::spawn(Arc::clone(self).run_tlc_ack_worker(tlc_ack_rx));
        tokio::spawn(Arc::clone(self).run_tlc_causal_worker(tlc_causal_rx, tlc_causal_tx));
        tokio::spawn(Arc::clone(self).run_client_block_worker(client_block_rx));
        tokio::spawn(Arc::clone(self).run_whisper_packet_worker(whisper_packet_rx));
        tokio::spawn(Arc::clone(self).run_whisper_status_worker(whisper_status_rx));

        // Timers.
        tokio::spawn(Arc::clone(&self.gossip).run_anti_entropy());
        tokio::spawn(Arc::clone(&self.gossip).run_route_rumors());
        tokio::spawn(Arc::clone(&self.whisper).run_queue());
        tokio::spawn(Arc::clone(&self.whisper).run_envelope_maintenance());
        tokio::spawn(Arc::clone(&self.whisper).run_status());
    }

    // -- read loops ---------------------------------------------------------

    /// Reads, decodes and dispatches peer datagrams. Grows the buffer and
    /// skips the datagram when a read fills it completely.
    async fn run_peer_socket(self: Arc<Self>) {
        let socket = self.conn.gossip_socket();
        let mut buffer = vec![0u8; MAX_BUFFER_SIZE];
        loop {
            let (length, sender) = match socket.recv_from(&mut buffer).await {
                Ok(read) => read,
                Err(err) => {
                    warn!(error = %err, "peer socket read failed");
                    continue;
                }
            };
            if length == buffer.len() {
                let grown = buffer.len() * 2;
                warn!(grown, "datagram filled the buffer, growing and skipping");
                buffer.resize(grown, 0);
                continue;
            }

            self.peers.add(sender);

            let packet = match packet::decode(&buffer[..length]) {
                Ok(packet) => packet,
                Err(err) => {
                    debug!(%sender, error = %err, "dropping undecodable datagram");
                    continue;
                }
            };

            let is_simple = matches!(packet, GossipPacket::Simple(_));
            if is_simple != self.config.simple {
                output::mode_error();
                continue;
            }

            self.dispatch_packet(packet, sender).await;
        }
    }

    async fn dispatch_packet(&self, packet: GossipPacket, sender: SocketAddr) {
        let Some(dispatch) = self.dispatch.lock().clone() else {
            return;
        };
        let is_err = match packet {
            GossipPacket::Simple(message) => dispatch.simple.send((message, sender)).await.is_err(),
            GossipPacket::Rumor(rumor) => dispatch.rumor.send((rumor, sender)).await.is_err(),
            GossipPacket::Status(status) => dispatch.status.send((status, sender)).await.is_err(),
            GossipPacket::Private(private) => {
                dispatch.private.send((private, sender)).await.is_err()
            }
            GossipPacket::DataRequest(request) => {
                dispatch.data_request.send((request, sender)).await.is_err()
            }
            GossipPacket::DataReply(reply) => {
                dispatch.data_reply.send((reply, sender)).await.is_err()
            }
            GossipPacket::SearchRequest(request) => {
                dispatch.search_request.send((request, sender)).await.is_err()
            }
            GossipPacket::SearchReply(reply) => {
                dispatch.search_reply.send((reply, sender)).await.is_err()
            }
            GossipPacket::Tlc(tlc) => dispatch.tlc.send((tlc, sender)).await.is_err(),
            GossipPacket::TlcAck(ack) => dispatch.tlc_ack.send((ack, sender)).await.is_err(),
            GossipPacket::Whisper(packet) => {
                dispatch.whisper_packet.send((packet, sender)).await.is_err()
            }
            GossipPacket::WhisperStatus(status) => {
                dispatch.whisper_status.send((status, sender)).await.is_err()
            }
        };
        if is_err {
            warn!("packet queue closed, dropping packet");
        }
    }

    /// Reads and classifies local client requests.
    async fn run_client_socket(self: Arc<Self>) {
        let socket = self.conn.client_socket();
        let mut buffer = vec![0u8; MAX_BUFFER_SIZE];
        loop {
            let (length, _) = match socket.recv_from(&mut buffer).await {
                Ok(read) => read,
                Err(err) => {
                    warn!(error = %err, "client socket read failed");
                    continue;
                }
            };
            if length == buffer.len() {
                let grown = buffer.len() * 2;
                buffer.resize(grown, 0);
                continue;
            }

            match packet::decode_client(&buffer[..length]) {
                Ok(request) => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        node.handle_client_request(request).await;
                    });
                }
                Err(err) => debug!(error = %err, "dropping undecodable client request"),
            }
        }
    }

    // -- client intents -----------------------------------------------------

    /// Executes one classified client request.
    pub async fn handle_client_request(self: &Arc<Self>, request: ClientRequest) {
        if self.config.simple {
            if request.text.is_empty() {
                output::mode_error();
                return;
            }
            output::client_message(&request.text, None);
            output::peers(&self.peers.joined());
            let packet = GossipPacket::Simple(SimpleMessage {
                original_name: self.config.name.clone(),
                relay_peer_addr: self.conn.own_addr().to_string(),
                contents: request.text,
            });
            self.conn
                .broadcast(&packet, &self.peers.snapshot(), None)
                .await;
            return;
        }

        match request.intent() {
            ClientIntent::Rumor => {
                output::client_message(&request.text, None);
                output::peers(&self.peers.joined());
                let rumor = self.gossip.create_rumor(&request.text);
                let id = rumor.id;
                let origin = rumor.origin.clone();
                self.gossip.spawn_monger(
                    GossipPacket::Rumor(rumor),
                    origin,
                    id,
                    self.conn.own_addr(),
                );
            }
            ClientIntent::Private => {
                let destination = request.destination.unwrap_or_default();
                output::client_message(&request.text, Some(&destination));
                let private = PrivateMessage {
                    origin: self.config.name.clone(),
                    id: 0,
                    text: request.text,
                    destination,
                    hop_limit: self.config.hop_limit,
                };
                self.events.rumor(crate::packet::RumorMessage {
                    origin: private.origin.clone(),
                    id: 0,
                    text: private.text.clone(),
                });
                self.forwarder.forward(GossipPacket::Private(private)).await;
            }
            ClientIntent::IndexFile => {
                let Some(file_name) = request.file else { return };
                self.index_file(&file_name).await;
            }
            ClientIntent::Download => {
                let (Some(file_name), Some(meta_hash)) = (request.file, request.request) else {
                    return;
                };
                let destination = request
                    .destination
                    .filter(|destination| !destination.is_empty());
                let transfer = Arc::clone(&self.transfer);
                tokio::spawn(async move {
                    transfer
                        .download_file(&file_name, destination.as_deref(), &meta_hash)
                        .await;
                });
            }
            ClientIntent::Search => {
                let Some(keywords) = request.keywords else { return };
                let mut keywords: Vec<String> = keywords
                    .split(',')
                    .filter(|keyword| !keyword.is_empty())
                    .map(str::to_string)
                    .collect();
                keywords.sort();
                keywords.dedup();
                if keywords.is_empty() {
                    return;
                }

                let budget = request.budget.unwrap_or(0);
                let doubling = budget == 0;
                let initial = if doubling { DEFAULT_SEARCH_BUDGET } else { budget };

                let search = Arc::clone(&self.search);
                tokio::spawn(async move {
                    search.run_search(keywords, initial, doubling).await;
                });
            }
            ClientIntent::Unknown => {
                debug!("client request with unknown field combination");
            }
        }
    }

    /// Indexes a file and, in the consensus modes, publishes it as a
    /// transaction block.
    async fn index_file(self: &Arc<Self>, file_name: &str) {
        let (metadata, existed) = match self.files.index_file(file_name).await {
            Ok(indexed) => indexed,
            Err(err) => {
                warn!(error = %err, "indexing failed");
                return;
            }
        };

        let publish = (self.config.publishes_tx_blocks() && !existed) || self.config.hw3ex4;
        if publish {
            let tlc = self.consensus.make_publish_message(
                &metadata.file_name,
                metadata.size(),
                metadata.metafile_hash.clone(),
            );
            if self.config.hw3ex2 && !self.config.hw3ex3 {
                let consensus = Arc::clone(&self.consensus);
                tokio::spawn(async move {
                    consensus.gossip_with_confirmation(tlc, false).await;
                });
            } else if let Some(dispatch) = self.dispatch.lock().clone() {
                let _ = dispatch.client_block.try_send(tlc);
            }
        } else if !existed {
            self.events.file_indexed(FileEvent {
                name: metadata.file_name.clone(),
                meta_hash: hex::encode(&metadata.metafile_hash),
                size: metadata.size(),
            });
        }
    }

    // -- workers ------------------------------------------------------------

    async fn run_simple_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(SimpleMessage, SocketAddr)>,
    ) {
        while let Some((mut message, sender)) = queue.recv().await {
            output::simple_message(
                &message.original_name,
                &message.relay_peer_addr,
                &message.contents,
            );
            output::peers(&self.peers.joined());

            message.relay_peer_addr = self.conn.own_addr().to_string();
            self.conn
                .broadcast(
                    &GossipPacket::Simple(message),
                    &self.peers.snapshot(),
                    Some(sender),
                )
                .await;
        }
    }

    async fn run_rumor_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(crate::packet::RumorMessage, SocketAddr)>,
    ) {
        while let Some((rumor, sender)) = queue.recv().await {
            let origin = rumor.origin.clone();
            let id = rumor.id;
            self.gossip
                .handle_gossip(GossipPacket::Rumor(rumor), &origin, id, sender)
                .await;
        }
    }

    async fn run_status_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(crate::packet::StatusPacket, SocketAddr)>,
    ) {
        while let Some((status, sender)) = queue.recv().await {
            self.gossip.handle_status(status, sender).await;
        }
    }

    async fn run_private_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(PrivateMessage, SocketAddr)>,
    ) {
        while let Some((private, sender)) = queue.recv().await {
            self.routing
                .update(&private.origin, private.id, sender, !private.text.is_empty());

            if private.destination == self.config.name {
                output::private_message(&private.origin, private.hop_limit, &private.text);
                self.events.rumor(crate::packet::RumorMessage {
                    origin: private.origin.clone(),
                    id: 0,
                    text: private.text.clone(),
                });
            } else {
                self.forwarder.forward(GossipPacket::Private(private)).await;
            }
        }
    }

    async fn run_data_request_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(DataRequest, SocketAddr)>,
    ) {
        while let Some((request, _sender)) = queue.recv().await {
            if request.destination == self.config.name {
                let data = self
                    .files
                    .data_for(&request.hash_value)
                    .map(|stored| stored.as_ref().clone())
                    .unwrap_or_default();
                let reply = GossipPacket::DataReply(DataReply {
                    origin: self.config.name.clone(),
                    destination: request.origin,
                    hop_limit: self.config.hop_limit,
                    hash_value: request.hash_value,
                    data,
                });
                self.forwarder.forward(reply).await;
            } else {
                self.forwarder
                    .forward(GossipPacket::DataRequest(request))
                    .await;
            }
        }
    }

    async fn run_data_reply_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(DataReply, SocketAddr)>,
    ) {
        while let Some((reply, _sender)) = queue.recv().await {
            if reply.destination == self.config.name {
                self.files.dispatch_reply(reply);
            } else {
                self.forwarder.forward(GossipPacket::DataReply(reply)).await;
            }
        }
    }

    async fn run_search_request_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(crate::packet::SearchRequest, SocketAddr)>,
    ) {
        while let Some((request, sender)) = queue.recv().await {
            self.search.handle_request(request, sender).await;
        }
    }

    async fn run_search_reply_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(crate::packet::SearchReply, SocketAddr)>,
    ) {
        while let Some((reply, _sender)) = queue.recv().await {
            if reply.destination == self.config.name {
                self.search.handle_reply(reply).await;
            } else {
                self.forwarder
                    .forward(GossipPacket::SearchReply(reply))
                    .await;
            }
        }
    }

    async fn run_tlc_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(TlcMessage, SocketAddr)>,
    ) {
        while let Some((tlc, sender)) = queue.recv().await {
            let origin = tlc.origin.clone();
            let id = tlc.id;
            self.gossip
                .handle_gossip(GossipPacket::Tlc(tlc.clone()), &origin, id, sender)
                .await;

            if self.config.publishes_tx_blocks() && origin != self.config.name {
                let dispatch = self.dispatch.lock().clone();
                if let Some(dispatch) = dispatch {
                    let _ = dispatch.tlc_causal.send((tlc, sender)).await;
                }
            }
        }
    }

    async fn run_tlc_ack_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(crate::packet::TlcAck, SocketAddr)>,
    ) {
        while let Some((ack, _sender)) = queue.recv().await {
            if ack.destination == self.config.name {
                debug!(origin = %ack.origin, id = ack.id, "received TLC ack");
                self.consensus.deliver_ack(ack);
            } else {
                self.forwarder.forward(GossipPacket::TlcAck(ack)).await;
            }
        }
    }

    async fn run_tlc_causal_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(TlcMessage, SocketAddr)>,
        requeue: mpsc::Sender<(TlcMessage, SocketAddr)>,
    ) {
        while let Some((tlc, sender)) = queue.recv().await {
            self.consensus
                .handle_tlc_message(tlc, sender, requeue.clone())
                .await;
        }
    }

    async fn run_client_block_worker(self: Arc<Self>, mut queue: mpsc::Receiver<TlcMessage>) {
        while let Some(tlc) = queue.recv().await {
            if self.config.hw3ex4 {
                self.consensus.qsc_round(tlc).await;
            } else {
                self.consensus.tlc_round(tlc).await;
            }
            debug!("consensus round completed");
        }
    }

    async fn run_whisper_packet_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(crate::packet::WhisperPacket, SocketAddr)>,
    ) {
        while let Some((packet, sender)) = queue.recv().await {
            self.whisper.handle_packet(packet, sender);
        }
    }

    async fn run_whisper_status_worker(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<(crate::packet::WhisperStatus, SocketAddr)>,
    ) {
        while let Some((status, sender)) = queue.recv().await {
            self.whisper.handle_status(status, sender).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_HOP_LIMIT, DEFAULT_STUBBORN_TIMEOUT_SECS};
    use std::path::PathBuf;

    async fn make_node(base: PathBuf, simple: bool) -> Arc<Node> {
        let config = NodeConfig::new(
            "local".to_string(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            1,
            simple,
            false,
            false,
            false,
            false,
            DEFAULT_HOP_LIMIT,
            0,
            0,
            DEFAULT_STUBBORN_TIMEOUT_SECS,
            base,
        );
        Node::new(config, None).await.expect("node")
    }

    #[tokio::test]
    async fn node_creates_working_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _node = make_node(dir.path().to_path_buf(), false).await;
        assert!(dir.path().join(crate::config::SHARE_DIR).is_dir());
        assert!(dir.path().join(crate::config::DOWNLOAD_DIR).is_dir());
    }

    #[tokio::test]
    async fn rumor_request_stores_and_numbers_locally() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = make_node(dir.path().to_path_buf(), false).await;

        node.handle_client_request(ClientRequest {
            text: "hello".into(),
            ..ClientRequest::default()
        })
        .await;

        assert_eq!(node.gossip.store().next_expected("local"), 2);
    }

    #[tokio::test]
    async fn index_request_fills_the_chunk_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = make_node(dir.path().to_path_buf(), false).await;

        tokio::fs::write(
            dir.path().join(crate::config::SHARE_DIR).join("f.bin"),
            vec![1u8; 9000],
        )
        .await
        .unwrap();

        node.handle_client_request(ClientRequest {
            file: Some("f.bin".into()),
            ..ClientRequest::default()
        })
        .await;

        let catalog = node.files.catalog_snapshot();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].chunk_count, 2);
        assert_eq!(catalog[0].size(), 9000);
    }

    #[tokio::test]
    async fn simple_mode_rejects_non_text_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = make_node(dir.path().to_path_buf(), true).await;

        // A file-index request carries no text: refused in simple mode.
        node.handle_client_request(ClientRequest {
            file: Some("f.bin".into()),
            ..ClientRequest::default()
        })
        .await;
        assert!(node.files.catalog_snapshot().is_empty());
    }

    #[tokio::test]
    async fn round_starts_at_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = make_node(dir.path().to_path_buf(), false).await;
        assert_eq!(node.round(), 0);
    }
}
