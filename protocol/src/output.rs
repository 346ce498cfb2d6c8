//! # Protocol Output Surface
//!
//! The structured stdout lines the node emits: RUMOR, STATUS, MONGERING,
//! DSDV, CONFIRMED, CONSENSUS and friends. These lines are an external
//! interface — downstream tooling parses them — so their exact shape is
//! fixed and kept apart from the `tracing` diagnostics, which go to stderr.
//!
//! Functions that also feed the viewer's log feed return the rendered line.

use std::net::SocketAddr;

use crate::packet::{PeerStatus, SearchResult, TlcMessage};

pub fn rumor(origin: &str, from: SocketAddr, id: u32, text: &str) {
    println!("RUMOR origin {origin} from {from} ID {id} contents {text}");
}

pub fn status(from: SocketAddr, entries: &[PeerStatus]) {
    let mut line = format!("STATUS from {from}");
    for entry in entries {
        line.push_str(&format!(
            " peer {} nextID {}",
            entry.identifier, entry.next_id
        ));
    }
    println!("{line}");
}

pub fn peers(joined: &str) {
    println!("PEERS {joined}");
}

pub fn mongering(peer: SocketAddr) {
    println!("MONGERING with {peer}");
}

pub fn flipped_coin(peer: SocketAddr) {
    println!("FLIPPED COIN sending rumor to {peer}");
}

pub fn in_sync(peer: SocketAddr) {
    println!("IN SYNC WITH {peer}");
}

pub fn dsdv(origin: &str, next_hop: SocketAddr) {
    println!("DSDV {origin} {next_hop}");
}

pub fn client_message(text: &str, destination: Option<&str>) {
    match destination {
        Some(dest) => println!("CLIENT MESSAGE {text} dest {dest}"),
        None => println!("CLIENT MESSAGE {text}"),
    }
}

pub fn simple_message(original_name: &str, relay: &str, contents: &str) {
    println!("SIMPLE MESSAGE origin {original_name} from {relay} contents {contents}");
}

pub fn private_message(origin: &str, hop_limit: u32, text: &str) {
    println!("PRIVATE origin {origin} hop-limit {hop_limit} contents {text}");
}

pub fn mode_error() {
    println!("ERROR: message can't be accepted in this operation mode");
}

pub fn downloading_metafile(file_name: &str, destination: &str) {
    println!("DOWNLOADING metafile of {file_name} from {destination}");
}

pub fn downloading_chunk(file_name: &str, chunk_index: u64, destination: &str) {
    println!("DOWNLOADING {file_name} chunk {chunk_index} from {destination}");
}

pub fn reconstructed(file_name: &str) {
    println!("RECONSTRUCTED file {file_name}");
}

pub fn search_match(origin: &str, result: &SearchResult) {
    let chunks = result
        .chunk_map
        .iter()
        .map(|index| index.to_string())
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "FOUND match {} at {} metafile={} chunks={}",
        result.file_name,
        origin,
        hex::encode(&result.metafile_hash),
        chunks
    );
}

pub fn search_finished() {
    println!("SEARCH FINISHED");
}

pub fn sending_ack(origin: &str, id: u32) {
    println!("SENDING ACK origin {origin} ID {id}");
}

/// UNCONFIRMED / CONFIRMED GOSSIP line. Returns the rendered line for the
/// viewer feed when the message is confirmed.
pub fn tlc_gossip(tlc: &TlcMessage) -> Option<String> {
    let body = format!(
        "GOSSIP origin {} ID {} filename {} size {} metahash {}",
        tlc.origin,
        tlc.id,
        tlc.tx_block.transaction.name,
        tlc.tx_block.transaction.size,
        hex::encode(&tlc.tx_block.transaction.metafile_hash)
    );
    if tlc.is_unconfirmed() {
        println!("UNCONFIRMED {body}");
        None
    } else {
        let line = format!("CONFIRMED {body}");
        println!("{line}");
        Some(line)
    }
}

pub fn rebroadcast(id: u32, witnesses: &[String]) {
    println!("RE-BROADCAST ID {id} WITNESSES {}", witnesses.join(", "));
}

/// ADVANCING TO round line. Returns the rendered line for the viewer feed.
pub fn advancing_round(round: u32, confirmations: &[(String, u32)]) -> String {
    let mut line = format!("ADVANCING TO round {round} BASED ON CONFIRMED MESSAGES");
    for (index, (origin, id)) in confirmations.iter().enumerate() {
        let n = index + 1;
        line.push_str(&format!(" origin{n} {origin} ID{n} {id},"));
    }
    let line = line.trim_end_matches(',').to_string();
    println!("{line}");
    line
}

/// CONSENSUS ON QSC line. `filenames` is the committed chain, oldest first.
/// Returns the rendered line for the viewer feed.
pub fn consensus_reached(round: u32, chosen: &TlcMessage, filenames: &[String]) -> String {
    let line = format!(
        "CONSENSUS ON QSC round {round} message origin {} ID {} filenames {} size {} metahash {}",
        chosen.origin,
        chosen.id,
        filenames.join(" "),
        chosen.tx_block.transaction.size,
        hex::encode(&chosen.tx_block.transaction.metafile_hash)
    );
    println!("{line}");
    line
}
