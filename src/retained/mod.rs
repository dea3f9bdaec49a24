//! Retained message store
//!
//! Holds the last retained PUBLISH per exact topic name. Lookups for a new
//! subscription scan the whole map against one filter, which keeps the store
//! a flat map instead of a second trie.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::{Publish, QoS};
use crate::topic::topic_matches_filter;

/// A retained message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    /// When the message was stored
    pub stored_at: SystemTime,
}

impl RetainedMessage {
    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            stored_at: SystemTime::now(),
        }
    }

    /// PUBLISH delivering this message to a subscription granted `granted`
    pub fn to_publish(&self, granted: QoS) -> Publish {
        Publish {
            dup: false,
            qos: self.qos.min(granted),
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

/// Outcome of [`RetainedStore::set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainAction {
    /// The message replaced or created the entry for its topic
    Stored,
    /// An empty payload removed the entry for its topic
    Cleared,
}

/// Thread-safe retained message store
#[derive(Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `message`, or clear its topic when the payload is empty
    pub fn set(&self, message: RetainedMessage) -> RetainAction {
        if message.payload.is_empty() {
            self.messages.remove(&message.topic);
            RetainAction::Cleared
        } else {
            self.messages.insert(message.topic.clone(), message);
            RetainAction::Stored
        }
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.get(topic).map(|m| m.value().clone())
    }

    pub fn remove(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.remove(topic).map(|(_, m)| m)
    }

    /// Every retained message whose topic matches `filter`, sorted by topic
    pub fn match_all(&self, filter: &str) -> Vec<RetainedMessage> {
        let mut matched: Vec<RetainedMessage> = self
            .messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.topic.cmp(&b.topic));
        matched
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
