//! # Subscriber Filters
//!
//! A filter is a local subscription: a decryption key (symmetric or
//! asymmetric, never both), a minimum PoW, and a set of topics. Envelopes
//! admitted by the relay are offered to every filter subscribed to their
//! topic; a successful decryption lands in the filter's inbox exactly
//! once per envelope. Filters live until explicitly removed.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::whisper::crypto::{generate_random_id, WhisperKey};
use crate::whisper::envelope::Envelope;
use crate::whisper::message::{open_envelope, ReceivedMessage};
use crate::whisper::topic::Topic;

/// Errors raised while managing filters.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filters must choose between symmetric and asymmetric keys")]
    AmbiguousKey,
    #[error("filter id collision")]
    DuplicateId,
}

/// One subscription.
pub struct Filter {
    /// Decryption key; `None` accepts plaintext envelopes.
    pub key: Option<WhisperKey>,
    /// Minimum PoW an envelope must carry for this subscriber.
    pub min_pow: f64,
    /// Topics of interest.
    pub topics: Vec<Topic>,
    /// envelope hash → delivered message.
    inbox: Mutex<HashMap<[u8; 32], ReceivedMessage>>,
}

impl Filter {
    pub fn new(key: Option<WhisperKey>, min_pow: f64, topics: Vec<Topic>) -> Self {
        Self {
            key,
            min_pow,
            topics,
            inbox: Mutex::new(HashMap::new()),
        }
    }

    /// Tries to open the envelope and deliver it, once.
    fn offer(&self, envelope: &Envelope, pow: f64) {
        if self.min_pow > 0.0 && pow < self.min_pow {
            return;
        }
        let Some(message) = open_envelope(envelope, self.key.as_ref()) else {
            debug!("failed to open envelope for subscriber");
            return;
        };
        self.inbox
            .lock()
            .entry(message.envelope_hash)
            .or_insert(message);
    }

    /// Drains the inbox.
    pub fn take_messages(&self) -> Vec<ReceivedMessage> {
        self.inbox.lock().drain().map(|(_, message)| message).collect()
    }

    /// Number of pending messages.
    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }
}

/// All live subscriptions, indexed by id and by topic.
#[derive(Default)]
pub struct FilterStore {
    subscribers: RwLock<HashMap<String, Arc<Filter>>>,
    by_topic: RwLock<HashMap<Topic, Vec<Arc<Filter>>>>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter and returns its id.
    pub fn add(&self, filter: Filter) -> Result<String, FilterError> {
        let id = generate_random_id();
        let filter = Arc::new(filter);

        let mut subscribers = self.subscribers.write();
        if subscribers.contains_key(&id) {
            return Err(FilterError::DuplicateId);
        }
        subscribers.insert(id.clone(), Arc::clone(&filter));

        let mut by_topic = self.by_topic.write();
        for topic in &filter.topics {
            by_topic.entry(*topic).or_default().push(Arc::clone(&filter));
        }
        Ok(id)
    }

    /// Removes a filter. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let Some(filter) = self.subscribers.write().remove(id) else {
            return false;
        };
        let mut by_topic = self.by_topic.write();
        for topic in &filter.topics {
            if let Some(list) = by_topic.get_mut(topic) {
                list.retain(|candidate| !Arc::ptr_eq(candidate, &filter));
            }
        }
        true
    }

    /// The filter registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<Filter>> {
        self.subscribers.read().get(id).cloned()
    }

    /// Offers an admitted envelope to every subscriber of its topic.
    pub fn notify(&self, envelope: &Envelope, pow: f64) {
        let candidates: Vec<Arc<Filter>> = self
            .by_topic
            .read()
            .get(&envelope.topic)
            .cloned()
            .unwrap_or_default();
        for filter in candidates {
            filter.offer(envelope, pow);
        }
    }

    /// All topics with at least one subscriber.
    pub fn subscribed_topics(&self) -> Vec<Topic> {
        self.by_topic
            .read()
            .iter()
            .filter(|(_, filters)| !filters.is_empty())
            .map(|(topic, _)| *topic)
            .collect()
    }
}
