//! # Viewer Feeds
//!
//! Bounded channels surfacing node activity to the (external) viewing
//! server: the latest user-visible rumors, file lifecycle events, and the
//! consensus log lines. The node only produces into these feeds; a viewer
//! takes each receiver once. Feeds overflow by dropping — a slow or absent
//! viewer must never stall protocol workers.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{CHANNEL_CAPACITY, LATEST_MESSAGES_BUFFER};
use crate::packet::RumorMessage;

/// A file the node indexed, downloaded, or learned about via search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub name: String,
    /// Hex-encoded metafile hash.
    pub meta_hash: String,
    pub size: i64,
}

/// All viewer feeds of a node.
pub struct EventBus {
    rumors_tx: mpsc::Sender<RumorMessage>,
    rumors_rx: Mutex<Option<mpsc::Receiver<RumorMessage>>>,
    indexed_tx: mpsc::Sender<FileEvent>,
    indexed_rx: Mutex<Option<mpsc::Receiver<FileEvent>>>,
    downloaded_tx: mpsc::Sender<FileEvent>,
    downloaded_rx: Mutex<Option<mpsc::Receiver<FileEvent>>>,
    searched_tx: mpsc::Sender<FileEvent>,
    searched_rx: Mutex<Option<mpsc::Receiver<FileEvent>>>,
    chain_log_tx: mpsc::Sender<String>,
    chain_log_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (rumors_tx, rumors_rx) = mpsc::channel(LATEST_MESSAGES_BUFFER);
        let (indexed_tx, indexed_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (downloaded_tx, downloaded_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (searched_tx, searched_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (chain_log_tx, chain_log_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            rumors_tx,
            rumors_rx: Mutex::new(Some(rumors_rx)),
            indexed_tx,
            indexed_rx: Mutex::new(Some(indexed_rx)),
            downloaded_tx,
            downloaded_rx: Mutex::new(Some(downloaded_rx)),
            searched_tx,
            searched_rx: Mutex::new(Some(searched_rx)),
            chain_log_tx,
            chain_log_rx: Mutex::new(Some(chain_log_rx)),
        }
    }

    /// Surfaces a user-visible rumor (never route rumors).
    pub fn rumor(&self, rumor: RumorMessage) {
        let _ = self.rumors_tx.try_send(rumor);
    }

    pub fn file_indexed(&self, event: FileEvent) {
        let _ = self.indexed_tx.try_send(event);
    }

    pub fn file_downloaded(&self, event: FileEvent) {
        let _ = self.downloaded_tx.try_send(event);
    }

    pub fn file_searched(&self, event: FileEvent) {
        let _ = self.searched_tx.try_send(event);
    }

    pub fn chain_log(&self, line: String) {
        let _ = self.chain_log_tx.try_send(line);
    }

    /// Takes the latest-rumors receiver. Yields `None` after the first call.
    pub fn take_rumors(&self) -> Option<mpsc::Receiver<RumorMessage>> {
        self.rumors_rx.lock().take()
    }

    pub fn take_indexed(&self) -> Option<mpsc::Receiver<FileEvent>> {
        self.indexed_rx.lock().take()
    }

    pub fn take_downloaded(&self) -> Option<mpsc::Receiver<FileEvent>> {
        self.downloaded_rx.lock().take()
    }

    pub fn take_searched(&self) -> Option<mpsc::Receiver<FileEvent>> {
        self.searched_rx.lock().take()
    }

    pub fn take_chain_log(&self) -> Option<mpsc::Receiver<String>> {
        self.chain_log_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rumor_feed_delivers() {
        let bus = EventBus::new();
        let mut rx = bus.take_rumors().expect("first take succeeds");
        bus.rumor(RumorMessage {
            origin: "A".into(),
            id: 1,
            text: "hi".into(),
        });
        let rumor = rx.recv().await.expect("delivered");
        assert_eq!(rumor.text, "hi");
    }

    #[test]
    fn receivers_are_taken_once() {
        let bus = EventBus::new();
        assert!(bus.take_chain_log().is_some());
        assert!(bus.take_chain_log().is_none());
    }

    #[test]
    fn full_feed_drops_instead_of_blocking() {
        let bus = EventBus::new();
        // Nobody took the receiver; fill past capacity without deadlock.
        for id in 0..2 * LATEST_MESSAGES_BUFFER as u32 {
            bus.rumor(RumorMessage {
                origin: "A".into(),
                id,
                text: "x".into(),
            });
        }
    }
}
