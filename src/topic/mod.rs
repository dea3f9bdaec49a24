//! Topic matching and the subscription index
//!
//! The index answers "which clients want a message published to this topic".
//! It is split into shards so that publishers on unrelated topic trees do not
//! contend on one lock:
//! - filters starting with a literal level live in the shard picked by
//!   hashing that level
//! - filters starting with `+` or `#` live in a separate wildcard-root shard
//!
//! A match therefore reads exactly two tries. A side table of filters per
//! client keeps `remove_client` proportional to that client's subscriptions.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{AHashMap, RandomState};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::QoS;

/// Number of literal shards used by [`TopicIndex::new`]
pub const DEFAULT_SHARDS: usize = 16;

/// Subscribers stored at one trie node: client id -> granted QoS
type NodeSubscribers = AHashMap<Arc<str>, QoS>;

/// One entry of a match result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    /// Highest QoS granted to this client among its matching filters
    pub qos: QoS,
}

/// Sharded, thread-safe subscription index
pub struct TopicIndex {
    shards: Box<[RwLock<TopicTrie<NodeSubscribers>>]>,
    wildcard_root: RwLock<TopicTrie<NodeSubscribers>>,
    client_filters: DashMap<Arc<str>, AHashMap<String, QoS>>,
    hasher: RandomState,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(TopicTrie::new()))
            .collect();

        Self {
            shards,
            wildcard_root: RwLock::new(TopicTrie::new()),
            client_filters: DashMap::new(),
            hasher: RandomState::new(),
        }
    }

    fn shard_for_level(&self, level: &str) -> &RwLock<TopicTrie<NodeSubscribers>> {
        let idx = (self.hasher.hash_one(level) as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn shard_for_filter(&self, filter: &str) -> &RwLock<TopicTrie<NodeSubscribers>> {
        match filter.split('/').next() {
            Some("+") | Some("#") => &self.wildcard_root,
            Some(level) => self.shard_for_level(level),
            None => &self.wildcard_root,
        }
    }

    /// Add or replace the subscription of `client_id` to `filter`.
    ///
    /// The filter must already be validated. Returns true if the client had
    /// no subscription to this exact filter before.
    pub fn subscribe(&self, client_id: &Arc<str>, filter: &str, qos: QoS) -> bool {
        let previous = self
            .shard_for_filter(filter)
            .write()
            .get_or_insert_with(filter, NodeSubscribers::new)
            .insert(client_id.clone(), qos);

        self.client_filters
            .entry(client_id.clone())
            .or_default()
            .insert(filter.to_string(), qos);

        previous.is_none()
    }

    /// Remove one subscription. Returns true if it existed.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let mut existed = false;
        self.shard_for_filter(filter)
            .write()
            .remove_where(filter, |subscribers| {
                existed = subscribers.remove(client_id).is_some();
                subscribers.is_empty()
            });

        if let Some(mut filters) = self.client_filters.get_mut(client_id) {
            filters.remove(filter);
        }
        self.client_filters
            .remove_if(client_id, |_, filters| filters.is_empty());

        existed
    }

    /// Remove every subscription of a client. Returns how many were removed.
    pub fn remove_client(&self, client_id: &str) -> usize {
        let Some((_, filters)) = self.client_filters.remove(client_id) else {
            return 0;
        };

        for filter in filters.keys() {
            self.shard_for_filter(filter)
                .write()
                .remove_where(filter, |subscribers| {
                    subscribers.remove(client_id);
                    subscribers.is_empty()
                });
        }

        filters.len()
    }

    /// All clients subscribed to a filter matching `topic`, ordered by client
    /// id, each listed once with its highest granted QoS.
    pub fn matches(&self, topic: &str) -> Vec<Subscriber> {
        let mut found: BTreeMap<Arc<str>, QoS> = BTreeMap::new();
        let mut collect = |subscribers: &NodeSubscribers| {
            for (client_id, &qos) in subscribers {
                found
                    .entry(client_id.clone())
                    .and_modify(|q| *q = (*q).max(qos))
                    .or_insert(qos);
            }
        };

        let first_level = topic.split('/').next().unwrap_or_default();
        self.shard_for_level(first_level)
            .read()
            .matches(topic, &mut collect);
        self.wildcard_root.read().matches(topic, &mut collect);

        found
            .into_iter()
            .map(|(client_id, qos)| Subscriber { client_id, qos })
            .collect()
    }

    /// Filters a client is subscribed to, sorted by filter
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        let mut filters: Vec<(String, QoS)> = self
            .client_filters
            .get(client_id)
            .map(|f| f.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        filters.sort();
        filters
    }

    /// Total number of (client, filter) subscriptions
    pub fn subscription_count(&self) -> usize {
        self.client_filters.iter().map(|e| e.value().len()).sum()
    }
}

impl Default for TopicIndex {
    fn default() -> Self {
        Self::new()
    }
}
