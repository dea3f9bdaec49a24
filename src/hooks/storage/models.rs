//! Serializable data models for storage.
//!
//! Storage-friendly versions of runtime types, encoded with bincode.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::{Publish, QoS, RetainHandling};
use crate::retained::RetainedMessage;
use crate::session::{InflightEntry, OutboundState, SessionSnapshot, Subscription};

/// Stored publish message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
}

/// Stored retained message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Unix timestamp in seconds when the message was stored
    pub timestamp_secs: u64,
}

/// Stored subscription
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub retain_handling: u8,
}

/// Stored outbound in-flight message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredInflight {
    pub publish: StoredPublish,
    /// 0 = PendingSend, 1 = AwaitingAck, 2 = AwaitingPubRec, 3 = AwaitingPubComp
    pub state: u8,
    pub retry_count: u32,
    /// Allocation order within the session
    pub seq: u64,
}

/// Stored session
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub username: Option<String>,
    pub subscriptions: Vec<StoredSubscription>,
    pub inflight: Vec<StoredInflight>,
    pub awaiting_release: Vec<u16>,
    pub queued: Vec<StoredPublish>,
}

// ============================================================================
// Conversion implementations
// ============================================================================

fn system_time_to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(stored: StoredPublish) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            dup: stored.dup,
            packet_id: stored.packet_id,
        }
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(rm: &RetainedMessage) -> Self {
        Self {
            topic: rm.topic.to_string(),
            payload: rm.payload.to_vec(),
            qos: rm.qos as u8,
            timestamp_secs: system_time_to_unix_secs(rm.stored_at),
        }
    }
}

impl From<StoredRetainedMessage> for RetainedMessage {
    fn from(stored: StoredRetainedMessage) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            stored_at: UNIX_EPOCH + Duration::from_secs(stored.timestamp_secs),
        }
    }
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            filter: sub.filter.clone(),
            qos: sub.qos as u8,
            retain_handling: sub.retain_handling as u8,
        }
    }
}

impl From<StoredSubscription> for Subscription {
    fn from(stored: StoredSubscription) -> Self {
        Self {
            filter: stored.filter,
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain_handling: RetainHandling::from_u8(stored.retain_handling).unwrap_or_default(),
        }
    }
}

impl From<&InflightEntry> for StoredInflight {
    fn from(entry: &InflightEntry) -> Self {
        let state = match entry.state {
            OutboundState::PendingSend => 0,
            OutboundState::AwaitingAck => 1,
            OutboundState::AwaitingPubRec => 2,
            OutboundState::AwaitingPubComp => 3,
        };
        Self {
            publish: StoredPublish::from(&entry.publish),
            state,
            retry_count: entry.retry_count,
            seq: entry.seq,
        }
    }
}

impl From<StoredInflight> for InflightEntry {
    fn from(stored: StoredInflight) -> Self {
        let state = match stored.state {
            1 => OutboundState::AwaitingAck,
            2 => OutboundState::AwaitingPubRec,
            3 => OutboundState::AwaitingPubComp,
            _ => OutboundState::PendingSend,
        };
        // The send time does not survive a restart
        let sent_at = (state != OutboundState::PendingSend).then(Instant::now);
        Self {
            publish: Publish::from(stored.publish),
            state,
            sent_at,
            retry_count: stored.retry_count,
            seq: stored.seq,
        }
    }
}

impl From<&SessionSnapshot> for StoredSession {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            client_id: snapshot.client_id.clone(),
            username: snapshot.username.clone(),
            subscriptions: snapshot
                .subscriptions
                .iter()
                .map(StoredSubscription::from)
                .collect(),
            inflight: snapshot.inflight.iter().map(StoredInflight::from).collect(),
            awaiting_release: snapshot.awaiting_release.clone(),
            queued: snapshot.queued.iter().map(StoredPublish::from).collect(),
        }
    }
}

impl From<StoredSession> for SessionSnapshot {
    fn from(stored: StoredSession) -> Self {
        Self {
            client_id: stored.client_id,
            username: stored.username,
            subscriptions: stored
                .subscriptions
                .into_iter()
                .map(Subscription::from)
                .collect(),
            inflight: stored.inflight.into_iter().map(InflightEntry::from).collect(),
            awaiting_release: stored.awaiting_release,
            queued: stored.queued.into_iter().map(Publish::from).collect(),
        }
    }
}
