//! # Wire Codec
//!
//! The tagged packet union exchanged between Murmur nodes over UDP, and the
//! thin client wire used by the local controller. Every datagram carries
//! exactly one encoded [`GossipPacket`] with exactly one active variant —
//! the enum encoding makes a zero-variant or multi-variant wire form
//! unrepresentable, and any datagram that does not decode to a variant is
//! rejected.
//!
//! Encoding is canonical binary via `bincode`: a fixed variant tag followed
//! by the variant's fields in declaration order. There is no length prefix;
//! the UDP message length is the frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_BUFFER_SIZE;
use crate::consensus::block::BlockPublish;

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// The datagram did not decode to a packet variant.
    #[error("malformed datagram: {0}")]
    Decode(#[from] bincode::Error),
    /// The datagram exceeds the receive buffer and was truncated.
    #[error("datagram of {0} bytes exceeds the {MAX_BUFFER_SIZE} byte buffer")]
    Oversize(usize),
}

// ---------------------------------------------------------------------------
// Wire Types
// ---------------------------------------------------------------------------

/// Broadcast-only legacy message, used in `-simple` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleMessage {
    /// Name of the node that authored the message.
    pub original_name: String,
    /// Address of the peer that relayed the message last.
    pub relay_peer_addr: String,
    /// Message body.
    pub contents: String,
}

/// A gossiped rumor. Empty text is a route rumor: it advances clocks and
/// routing tables but is not surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RumorMessage {
    /// Authoring node.
    pub origin: String,
    /// Per-origin sequence number, starting at 1.
    pub id: u32,
    /// Message body. Empty for route rumors.
    pub text: String,
}

/// One (origin, next-expected) entry of a status packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Origin name.
    pub identifier: String,
    /// Smallest sequence number not yet stored for that origin.
    pub next_id: u32,
}

/// Snapshot of a node's vector clock, exchanged for anti-entropy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPacket {
    /// One entry per known origin.
    pub want: Vec<PeerStatus>,
}

impl StatusPacket {
    /// Returns the next-expected sequence this status advertises for
    /// `origin`, if any.
    pub fn next_for(&self, origin: &str) -> Option<u32> {
        self.want
            .iter()
            .find(|entry| entry.identifier == origin)
            .map(|entry| entry.next_id)
    }
}

/// Point-to-point text message, forwarded hop by hop along the DSDV table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub origin: String,
    pub id: u32,
    pub text: String,
    pub destination: String,
    pub hop_limit: u32,
}

/// Request for the data stored under a SHA-256 hash (chunk or metafile).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub origin: String,
    pub destination: String,
    pub hop_limit: u32,
    /// SHA-256 digest identifying the requested data.
    pub hash_value: Vec<u8>,
}

/// Reply to a [`DataRequest`]. `data` is empty when the responder does not
/// hold the requested hash; receivers validate `sha256(data) == hash_value`
/// before accepting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReply {
    pub origin: String,
    pub destination: String,
    pub hop_limit: u32,
    pub hash_value: Vec<u8>,
    pub data: Vec<u8>,
}

/// Budgeted keyword search, flooded with budget subdivision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub origin: String,
    pub budget: u64,
    pub keywords: Vec<String>,
}

/// Matches returned to a search origin, routed point-to-point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReply {
    pub origin: String,
    pub destination: String,
    pub hop_limit: u32,
    pub results: Vec<SearchResult>,
}

/// One matching file in a [`SearchReply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub file_name: String,
    pub metafile_hash: Vec<u8>,
    /// 1-based indices of the chunks the replier holds, sorted, unique.
    pub chunk_map: Vec<u64>,
    pub chunk_count: u64,
}

/// Threshold-logical-clock message carrying a block proposal.
///
/// `confirmed == -1` marks an unconfirmed proposal; otherwise it names the
/// id of the proposal this message confirms. The vector clock snapshot
/// gates causal delivery of confirmations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlcMessage {
    pub origin: String,
    pub id: u32,
    pub confirmed: i32,
    pub tx_block: BlockPublish,
    pub vector_clock: StatusPacket,
    /// Uniform random score used by QSC to break ties; higher wins.
    pub fitness: f32,
}

impl TlcMessage {
    /// True for an unconfirmed proposal.
    pub fn is_unconfirmed(&self) -> bool {
        self.confirmed == -1
    }
}

/// Acknowledgement of an unconfirmed [`TlcMessage`], routed point-to-point
/// back to the proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlcAck {
    pub origin: String,
    pub id: u32,
    pub destination: String,
    pub hop_limit: u32,
}

/// Carrier for a Whisper envelope. `payload` is the encoded
/// [`crate::whisper::Envelope`]; `code` distinguishes payload kinds
/// (only the messages code is carried on this packet today).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhisperPacket {
    pub code: u32,
    pub size: u32,
    pub payload: Vec<u8>,
}

/// Whisper parameter advertisement, disseminated through the rumor layer.
///
/// `code` selects which fields are meaningful: a full status carries both
/// the bloom filter and the PoW requirement, a bloom exchange only the
/// filter, a PoW requirement only the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhisperStatus {
    pub origin: String,
    pub id: u32,
    pub code: u32,
    pub bloom: Vec<u8>,
    pub pow: f64,
}

// ---------------------------------------------------------------------------
// Packet Union
// ---------------------------------------------------------------------------

/// The tagged union carried by every peer-facing UDP datagram.
///
/// Exactly one variant is active per packet. Decoding a datagram that does
/// not match any variant fails with [`WireError::Decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipPacket {
    Simple(SimpleMessage),
    Rumor(RumorMessage),
    Status(StatusPacket),
    Private(PrivateMessage),
    DataRequest(DataRequest),
    DataReply(DataReply),
    SearchRequest(SearchRequest),
    SearchReply(SearchReply),
    Tlc(TlcMessage),
    TlcAck(TlcAck),
    Whisper(WhisperPacket),
    WhisperStatus(WhisperStatus),
}

// ---------------------------------------------------------------------------
// Client Wire
// ---------------------------------------------------------------------------

/// The local client → node record. Which fields are present decides the
/// intent (see [`ClientRequest::intent`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub text: String,
    pub destination: Option<String>,
    pub file: Option<String>,
    pub request: Option<Vec<u8>>,
    pub keywords: Option<String>,
    pub budget: Option<u64>,
}

/// User intent classified from the present fields of a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIntent {
    /// Text only: publish a rumor (or a simple broadcast in simple mode).
    Rumor,
    /// Text + destination: private message.
    Private,
    /// File only: index it from the share directory.
    IndexFile,
    /// File + request + destination: download by metafile hash.
    Download,
    /// Keywords: keyword search (budget optional).
    Search,
    /// Field combination matching no known intent.
    Unknown,
}

impl ClientRequest {
    /// Classifies the request by reading only which fields are present,
    /// following the legacy rules.
    pub fn intent(&self) -> ClientIntent {
        let has_text = !self.text.is_empty();
        match (
            has_text,
            self.destination.is_some(),
            self.file.is_some(),
            self.request.is_some(),
            self.keywords.is_some(),
        ) {
            (true, false, false, false, false) => ClientIntent::Rumor,
            (true, true, false, false, false) => ClientIntent::Private,
            (false, _, true, true, false) => ClientIntent::Download,
            (false, false, true, false, false) => ClientIntent::IndexFile,
            (false, false, false, false, true) => ClientIntent::Search,
            _ => ClientIntent::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encodes a packet into its canonical binary form.
pub fn encode(packet: &GossipPacket) -> Result<Vec<u8>, WireError> {
    Ok(bincode::serialize(packet)?)
}

/// Decodes a peer datagram. Rejects frames that exceed the receive buffer.
pub fn decode(bytes: &[u8]) -> Result<GossipPacket, WireError> {
    if bytes.len() > MAX_BUFFER_SIZE {
        return Err(WireError::Oversize(bytes.len()));
    }
    Ok(bincode::deserialize(bytes)?)
}

/// Encodes a client record.
pub fn encode_client(request: &ClientRequest) -> Result<Vec<u8>, WireError> {
    Ok(bincode::serialize(request)?)
}

/// Decodes a client datagram.
pub fn decode_client(bytes: &[u8]) -> Result<ClientRequest, WireError> {
    if bytes.len() > MAX_BUFFER_SIZE {
        return Err(WireError::Oversize(bytes.len()));
    }
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::block::TxPublish;

    fn sample_packets() -> Vec<GossipPacket> {
        vec![
            GossipPacket::Simple(SimpleMessage {
                original_name: "A".into(),
                relay_peer_addr: "127.0.0.1:5000".into(),
                contents: "hello".into(),
            }),
            GossipPacket::Rumor(RumorMessage {
                origin: "A".into(),
                id: 1,
                text: "hi".into(),
            }),
            GossipPacket::Status(StatusPacket {
                want: vec![PeerStatus {
                    identifier: "A".into(),
                    next_id: 2,
                }],
            }),
            GossipPacket::Private(PrivateMessage {
                origin: "A".into(),
                id: 0,
                text: "psst".into(),
                destination: "B".into(),
                hop_limit: 10,
            }),
            GossipPacket::DataRequest(DataRequest {
                origin: "A".into(),
                destination: "B".into(),
                hop_limit: 10,
                hash_value: vec![0xab; 32],
            }),
            GossipPacket::DataReply(DataReply {
                origin: "B".into(),
                destination: "A".into(),
                hop_limit: 10,
                hash_value: vec![0xab; 32],
                data: vec![1, 2, 3],
            }),
            GossipPacket::SearchRequest(SearchRequest {
                origin: "A".into(),
                budget: 2,
                keywords: vec!["foo".into()],
            }),
            GossipPacket::SearchReply(SearchReply {
                origin: "C".into(),
                destination: "A".into(),
                hop_limit: 10,
                results: vec![SearchResult {
                    file_name: "foobar".into(),
                    metafile_hash: vec![0xcd; 32],
                    chunk_map: vec![1, 2, 3],
                    chunk_count: 3,
                }],
            }),
            GossipPacket::Tlc(TlcMessage {
                origin: "A".into(),
                id: 4,
                confirmed: -1,
                tx_block: BlockPublish {
                    prev_hash: [0u8; 32],
                    transaction: TxPublish {
                        name: "file.bin".into(),
                        size: 20_000,
                        metafile_hash: vec![0xee; 32],
                    },
                },
                vector_clock: StatusPacket::default(),
                fitness: 0.5,
            }),
            GossipPacket::TlcAck(TlcAck {
                origin: "B".into(),
                id: 4,
                destination: "A".into(),
                hop_limit: 10,
            }),
            GossipPacket::Whisper(WhisperPacket {
                code: 1,
                size: 3,
                payload: vec![9, 9, 9],
            }),
            GossipPacket::WhisperStatus(WhisperStatus {
                origin: "A".into(),
                id: 7,
                code: 0,
                bloom: vec![0u8; 64],
                pow: 0.2,
            }),
        ]
    }

    #[test]
    fn every_variant_round_trips() {
        for packet in sample_packets() {
            let bytes = encode(&packet).expect("encode");
            let decoded = decode(&bytes).expect("decode");
            assert_eq!(packet, decoded);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode(&[0xff; 16]).is_err());
    }

    #[test]
    fn empty_datagram_is_rejected() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn oversize_datagram_is_rejected() {
        let bytes = vec![0u8; MAX_BUFFER_SIZE + 1];
        assert!(matches!(decode(&bytes), Err(WireError::Oversize(_))));
    }

    #[test]
    fn client_request_round_trips() {
        let request = ClientRequest {
            text: String::new(),
            destination: Some("B".into()),
            file: Some("file.bin".into()),
            request: Some(vec![0xab; 32]),
            keywords: None,
            budget: None,
        };
        let bytes = encode_client(&request).expect("encode");
        assert_eq!(decode_client(&bytes).expect("decode"), request);
    }

    #[test]
    fn client_intent_classification() {
        let rumor = ClientRequest {
            text: "hi".into(),
            ..ClientRequest::default()
        };
        assert_eq!(rumor.intent(), ClientIntent::Rumor);

        let private = ClientRequest {
            text: "hi".into(),
            destination: Some("B".into()),
            ..ClientRequest::default()
        };
        assert_eq!(private.intent(), ClientIntent::Private);

        let index = ClientRequest {
            file: Some("f".into()),
            ..ClientRequest::default()
        };
        assert_eq!(index.intent(), ClientIntent::IndexFile);

        let download = ClientRequest {
            file: Some("f".into()),
            request: Some(vec![1]),
            destination: Some("B".into()),
            ..ClientRequest::default()
        };
        assert_eq!(download.intent(), ClientIntent::Download);

        let search = ClientRequest {
            keywords: Some("foo,bar".into()),
            budget: Some(0),
            ..ClientRequest::default()
        };
        assert_eq!(search.intent(), ClientIntent::Search);

        let nonsense = ClientRequest {
            text: "hi".into(),
            keywords: Some("foo".into()),
            ..ClientRequest::default()
        };
        assert_eq!(nonsense.intent(), ClientIntent::Unknown);
    }

    #[test]
    fn status_lookup() {
        let status = StatusPacket {
            want: vec![
                PeerStatus {
                    identifier: "A".into(),
                    next_id: 3,
                },
                PeerStatus {
                    identifier: "B".into(),
                    next_id: 1,
                },
            ],
        };
        assert_eq!(status.next_for("A"), Some(3));
        assert_eq!(status.next_for("C"), None);
    }
}
