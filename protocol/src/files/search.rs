//! # Budgeted Keyword Search
//!
//! Search requests flood the overlay with a budget that is decremented at
//! every receiver and split as evenly as possible over randomly chosen
//! peers. A search issued without an explicit budget starts at the default
//! and doubles every tick until the cap; it terminates early once enough
//! distinct files are fully locatable. Matches travel back to the origin
//! as point-to-point search replies.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{interval, Instant};
use tracing::debug;

use crate::config::{
    NodeConfig, MAX_SEARCH_BUDGET, SEARCH_MATCH_THRESHOLD, SEARCH_REQUEST_DUPLICATE_TIMEOUT,
    SEARCH_TIMEOUT,
};
use crate::events::{EventBus, FileEvent};
use crate::files::index::FileEngine;
use crate::files::transfer::TransferEngine;
use crate::output;
use crate::packet::{GossipPacket, SearchReply, SearchRequest, SearchResult};
use crate::peers::PeerSet;
use crate::routing::Forwarder;
use crate::transport::ConnectionHandler;

/// The search engine: local matching, budget fan-out, duplicate
/// suppression, and reply absorption.
pub struct SearchEngine {
    config: Arc<NodeConfig>,
    files: Arc<FileEngine>,
    transfer: Arc<TransferEngine>,
    peers: Arc<PeerSet>,
    conn: Arc<ConnectionHandler>,
    forwarder: Arc<Forwarder>,
    events: Arc<EventBus>,
    /// (origin + sorted keywords) → last accepted arrival.
    recent: Mutex<HashMap<String, Instant>>,
}

impl SearchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        files: Arc<FileEngine>,
        transfer: Arc<TransferEngine>,
        peers: Arc<PeerSet>,
        conn: Arc<ConnectionHandler>,
        forwarder: Arc<Forwarder>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            files,
            transfer,
            peers,
            conn,
            forwarder,
            events,
            recent: Mutex::new(HashMap::new()),
        }
    }

    // -- duplicate suppression ----------------------------------------------

    /// True when an identical (origin, keywords) request was accepted
    /// within the suppression window. On a fresh accept the timestamp is
    /// refreshed unconditionally.
    pub fn is_duplicate(&self, request: &SearchRequest) -> bool {
        let mut keywords = request.keywords.clone();
        keywords.sort();
        let key = format!("{}{}", request.origin, keywords.join(""));

        let mut recent = self.recent.lock();
        let now = Instant::now();
        if let Some(last) = recent.get(&key) {
            if now.duration_since(*last) < SEARCH_REQUEST_DUPLICATE_TIMEOUT {
                return true;
            }
        }
        recent.insert(key, now);
        false
    }

    // -- matching -----------------------------------------------------------

    /// Local files matching the keywords with at least one chunk present.
    fn local_matches(&self, keywords: &[String]) -> Vec<SearchResult> {
        self.files
            .catalog_snapshot()
            .into_iter()
            .filter(|metadata| {
                keyword_matches(&metadata.file_name, keywords) && metadata.chunks_present() > 0
            })
            .map(|metadata| SearchResult {
                file_name: metadata.file_name.clone(),
                metafile_hash: metadata.metafile_hash.clone(),
                chunk_map: metadata.chunk_map(),
                chunk_count: metadata.chunk_count,
            })
            .collect()
    }

    /// True once enough distinct matching files are fully locatable and
    /// not yet owned.
    fn threshold_reached(&self, keywords: &[String]) -> bool {
        let matches = self
            .files
            .catalog_snapshot()
            .into_iter()
            .filter(|metadata| {
                keyword_matches(&metadata.file_name, keywords)
                    && metadata.size() == 0
                    && self.files.all_chunks_located(metadata)
            })
            .count();
        matches >= SEARCH_MATCH_THRESHOLD
    }

    // -- request path -------------------------------------------------------

    /// Handles a search request arriving from the network: answers with
    /// local matches (never to ourselves), then forwards the remaining
    /// budget.
    pub async fn handle_request(&self, mut request: SearchRequest, sender: SocketAddr) {
        if self.is_duplicate(&request) {
            debug!(origin = %request.origin, "suppressing duplicate search");
            return;
        }

        if request.origin != self.config.name {
            let results = self.local_matches(&request.keywords);
            if !results.is_empty() {
                let reply = GossipPacket::SearchReply(SearchReply {
                    origin: self.config.name.clone(),
                    destination: request.origin.clone(),
                    hop_limit: self.config.hop_limit,
                    results,
                });
                self.forwarder.forward(reply).await;
            }
        }

        request.budget = request.budget.saturating_sub(1);
        self.forward_with_budget(request, Some(sender)).await;
    }

    /// Splits the request's budget as evenly as possible over random
    /// distinct peers (never back towards `exclude`): each chosen peer
    /// gets `floor(B/n)`, and `B mod n` of them get one extra.
    pub async fn forward_with_budget(&self, request: SearchRequest, exclude: Option<SocketAddr>) {
        let mut chosen: Vec<SocketAddr> = exclude.into_iter().collect();
        let mut available = self.peers.difference_excluding(&chosen);

        if request.budget == 0 || available.is_empty() {
            return;
        }

        let per_peer = request.budget / available.len() as u64;
        let mut extra = request.budget % available.len() as u64;

        while !available.is_empty() {
            if per_peer == 0 && extra == 0 {
                return;
            }
            let Some(peer) = self.peers.random_excluding(&chosen) else {
                return;
            };

            let budget = if extra > 0 {
                extra -= 1;
                per_peer + 1
            } else {
                per_peer
            };

            let packet = GossipPacket::SearchRequest(SearchRequest {
                origin: request.origin.clone(),
                budget,
                keywords: request.keywords.clone(),
            });
            self.conn.send(&packet, peer).await;

            chosen.push(peer);
            available = self.peers.difference_excluding(&chosen);
        }
    }

    /// Drives a locally issued search: forward, then tick — finishing on
    /// the match threshold, giving up when the doubling budget passes the
    /// cap. `doubling` is set when the client supplied no budget.
    pub async fn run_search(&self, keywords: Vec<String>, initial_budget: u64, doubling: bool) {
        let mut budget = initial_budget;
        let request = |budget: u64| SearchRequest {
            origin: self.config.name.clone(),
            budget,
            keywords: keywords.clone(),
        };

        if budget == 0 {
            return;
        }
        // Budget is spent at the issuer like at any receiver.
        self.forward_with_budget(request(budget - 1), None).await;

        let mut ticker = interval(SEARCH_TIMEOUT);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;

            if budget > MAX_SEARCH_BUDGET {
                debug!("search budget exhausted");
                return;
            }
            if self.threshold_reached(&keywords) {
                output::search_finished();
                return;
            }
            if doubling {
                budget *= 2;
            }
            self.forward_with_budget(request(budget.saturating_sub(1)), None)
                .await;
        }
    }

    // -- reply path ---------------------------------------------------------

    /// Absorbs a search reply addressed to this node.
    pub async fn handle_reply(&self, reply: SearchReply) {
        for result in reply.results {
            self.handle_result(&reply.origin, result).await;
        }
    }

    async fn handle_result(&self, replier: &str, result: SearchResult) {
        let (metadata, existed) = self.files.catalog_entry(
            &result.file_name,
            &result.metafile_hash,
            result.chunk_count,
        );

        if !existed {
            output::search_match(replier, &result);
            self.events.file_searched(FileEvent {
                name: metadata.file_name.clone(),
                meta_hash: hex::encode(&metadata.metafile_hash),
                size: metadata.size(),
            });
        }

        // Ownership is merged on every reply, not just the first sighting.
        self.transfer
            .absorb_search_result(&metadata, replier, &result.chunk_map)
            .await;
    }
}

/// A file name matches when any keyword is contained as a substring or
/// matches as a regular expression.
pub fn keyword_matches(file_name: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|keyword| {
        if file_name.contains(keyword.as_str()) {
            return true;
        }
        Regex::new(keyword)
            .map(|re| re.is_match(file_name))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_HOP_LIMIT, DEFAULT_STUBBORN_TIMEOUT_SECS};
    use crate::events::EventBus;
    use crate::routing::RoutingTable;
    use std::path::PathBuf;

    async fn make_search(peers: &[SocketAddr]) -> (Arc<SearchEngine>, Arc<FileEngine>) {
        let conn = Arc::new(
            ConnectionHandler::bind(
                "127.0.0.1:0".parse().unwrap(),
                "127.0.0.1:0".parse().unwrap(),
            )
            .await
            .expect("bind"),
        );
        let config = Arc::new(NodeConfig::new(
            "local".to_string(),
            conn.own_addr(),
            "127.0.0.1:0".parse().unwrap(),
            peers.to_vec(),
            1,
            false,
            false,
            false,
            false,
            false,
            DEFAULT_HOP_LIMIT,
            0,
            0,
            DEFAULT_STUBBORN_TIMEOUT_SECS,
            PathBuf::from("."),
        ));
        let files = Arc::new(FileEngine::new(Arc::clone(&config)));
        let peer_set = Arc::new(PeerSet::new(conn.own_addr(), peers));
        let routing = Arc::new(RoutingTable::new());
        let forwarder = Arc::new(Forwarder::new(Arc::clone(&routing), Arc::clone(&conn)));
        let events = Arc::new(EventBus::new());
        let transfer = Arc::new(TransferEngine::new(
            Arc::clone(&config),
            Arc::clone(&files),
            Arc::clone(&forwarder),
            Arc::clone(&events),
        ));
        let search = Arc::new(SearchEngine::new(
            config,
            Arc::clone(&files),
            transfer,
            peer_set,
            conn,
            forwarder,
            events,
        ));
        (search, files)
    }

    #[test]
    fn substring_and_regex_keywords_match() {
        assert!(keyword_matches("foobar.txt", &["foo".to_string()]));
        assert!(keyword_matches("foobar.txt", &["^foo.*txt$".to_string()]));
        assert!(!keyword_matches("other.txt", &["foo".to_string()]));
        // An invalid regex still matches as a plain substring.
        assert!(keyword_matches("a(b.txt", &["a(b".to_string()]));
    }

    #[tokio::test]
    async fn duplicate_requests_are_suppressed_within_window() {
        let (search, _) = make_search(&[]).await;
        let request = SearchRequest {
            origin: "A".into(),
            budget: 2,
            keywords: vec!["foo".into(), "bar".into()],
        };
        assert!(!search.is_duplicate(&request));
        assert!(search.is_duplicate(&request));

        // Keyword order does not change the identifier.
        let reordered = SearchRequest {
            origin: "A".into(),
            budget: 2,
            keywords: vec!["bar".into(), "foo".into()],
        };
        assert!(search.is_duplicate(&reordered));

        // A different origin is a different identifier.
        let other = SearchRequest {
            origin: "B".into(),
            budget: 2,
            keywords: vec!["foo".into(), "bar".into()],
        };
        assert!(!search.is_duplicate(&other));
    }

    #[tokio::test]
    async fn local_matches_require_present_chunks() {
        let (search, files) = make_search(&[]).await;
        files.index_bytes("foobar.bin", &vec![1u8; 100]);
        // Known from the network but no chunks held: not served.
        files.catalog_entry("football.bin", &[0xbb; 32], 2);

        let results = search.local_matches(&["foo".to_string()]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "foobar.bin");
        assert_eq!(results[0].chunk_map, vec![1]);
    }

    #[tokio::test]
    async fn threshold_counts_only_locatable_unowned_files() {
        let (search, files) = make_search(&[]).await;

        // Fully owned locally (size != 0): never counts.
        files.index_bytes("foo-owned.bin", &vec![1u8; 100]);

        // Two remote matches, all chunks located.
        for name in ["foo-one.bin", "foo-two.bin"] {
            let contents = vec![name.as_bytes()[4]; 100];
            let chunk = crate::files::index::sha256(&contents);
            let metafile = chunk.to_vec();
            let metahash = crate::files::index::sha256(&metafile);
            files.store_data(&metahash, metafile.clone());
            files.catalog_entry(name, &metahash, 1);
            files.record_owner("B", &[1], &metafile);
        }

        assert!(search.threshold_reached(&["foo".to_string()]));
        assert!(!search.threshold_reached(&["nomatch".to_string()]));
    }

    #[tokio::test]
    async fn forwarding_stops_without_budget_or_peers() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (search, _) = make_search(&[peer]).await;
        // Exhausted budget: nothing to split.
        search
            .forward_with_budget(
                SearchRequest {
                    origin: "local".into(),
                    budget: 0,
                    keywords: vec!["x".into()],
                },
                None,
            )
            .await;
        // Only known peer excluded: nothing to choose.
        search
            .forward_with_budget(
                SearchRequest {
                    origin: "local".into(),
                    budget: 4,
                    keywords: vec!["x".into()],
                },
                Some(peer),
            )
            .await;
    }

    #[test]
    fn budget_split_arithmetic() {
        // floor(B/n) with B mod n peers receiving one extra.
        let cases = [
            (7u64, 3u64, vec![3, 2, 2]),
            (2, 3, vec![1, 1, 0]),
            (6, 2, vec![3, 3]),
        ];
        for (budget, peers, expected) in cases {
            let per_peer = budget / peers;
            let extra = budget % peers;
            let shares: Vec<u64> = (0..peers)
                .map(|i| if i < extra { per_peer + 1 } else { per_peer })
                .collect();
            assert_eq!(shares, expected);
            assert_eq!(shares.iter().sum::<u64>(), budget);
        }
    }
}
