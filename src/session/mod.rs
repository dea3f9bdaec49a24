//! MQTT Session Management
//!
//! A session is the per-client state that outlives a single connection when
//! the client asked for a persistent session (clean session = 0):
//! subscriptions, the in-flight tables and the queue of messages waiting for
//! the client to come back or for a packet id to free up.

mod inflight;

pub use inflight::{
    retry_backoff, InboundReceive, Inbound, InflightEntry, Outbound, OutboundState,
    PubRecOutcome, Resend,
};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{Publish, QoS, RetainHandling, Will};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A connection currently owns the session
    Connected,
    /// No connection; state kept until expiry or a clean reconnect
    Disconnected,
}

/// A subscription owned by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    /// Granted QoS
    pub qos: QoS,
    pub retain_handling: RetainHandling,
}

/// Per-session capacity limits
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Outbound packet ids in use at once (0 = whole id space)
    pub max_inflight: u16,
    /// Queued messages per session (0 = never queue)
    pub max_queued: usize,
    /// Inbound QoS 2 exchanges awaiting PUBREL (0 = unbounded)
    pub max_awaiting_rel: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_inflight: 1024,
            max_queued: 1000,
            max_awaiting_rel: 1024,
        }
    }
}

/// Client session
#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    pub state: SessionState,
    pub clean_session: bool,
    pub username: Option<String>,
    pub will: Option<Will>,
    /// Subscriptions keyed by filter
    pub subscriptions: BTreeMap<String, Subscription>,
    pub outbound: Outbound,
    pub inbound: Inbound,
    /// Messages for an offline client or waiting for a free packet id
    queue: VecDeque<Publish>,
    max_queued: usize,
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, limits: SessionLimits) -> Self {
        Self {
            client_id,
            state: SessionState::Connected,
            clean_session,
            username: None,
            will: None,
            subscriptions: BTreeMap::new(),
            outbound: Outbound::new(limits.max_inflight),
            inbound: Inbound::new(limits.max_awaiting_rel),
            queue: VecDeque::new(),
            max_queued: limits.max_queued,
            disconnected_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn mark_connected(&mut self) {
        self.state = SessionState::Connected;
        self.disconnected_at = None;
    }

    pub fn mark_disconnected(&mut self, now: Instant) {
        self.state = SessionState::Disconnected;
        self.disconnected_at = Some(now);
    }

    /// A disconnected persistent session past `expiry`. `None` never expires.
    pub fn is_expired(&self, now: Instant, expiry: Option<Duration>) -> bool {
        match (self.state, self.disconnected_at, expiry) {
            (SessionState::Disconnected, Some(at), Some(expiry)) => {
                now.saturating_duration_since(at) >= expiry
            }
            _ => false,
        }
    }

    /// Add or replace a subscription. Returns true if the filter is new.
    pub fn add_subscription(&mut self, subscription: Subscription) -> bool {
        self.subscriptions
            .insert(subscription.filter.clone(), subscription)
            .is_none()
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Append a message to the queue. When the queue is full the oldest
    /// message is dropped and returned.
    pub fn enqueue(&mut self, publish: Publish) -> Option<Publish> {
        if self.max_queued == 0 {
            return Some(publish);
        }
        let dropped = if self.queue.len() >= self.max_queued {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(publish);
        dropped
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Take the oldest queued message if it can go out.
    ///
    /// A QoS > 0 message comes back registered in the outbound table
    /// (`PendingSend`) with its packet id assigned. `None` when the queue is
    /// empty or no packet id is free.
    pub fn release_next(&mut self) -> Option<Publish> {
        let front = self.queue.front()?;
        if front.qos == QoS::AtMostOnce {
            return self.queue.pop_front();
        }
        let publish = self.outbound.allocate(front).ok()?;
        self.queue.pop_front();
        Some(publish)
    }

    /// Take queued messages in order while packet ids are available
    pub fn release_queued(&mut self) -> Vec<Publish> {
        std::iter::from_fn(|| self.release_next()).collect()
    }

    /// Owned copy of the persistent parts of the session
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            client_id: self.client_id.to_string(),
            username: self.username.clone(),
            subscriptions: self.subscriptions.values().cloned().collect(),
            inflight: self.outbound.entries().cloned().collect(),
            awaiting_release: self.inbound.packet_ids(),
            queued: self.queue.iter().cloned().collect(),
        }
    }

    /// Rebuild a disconnected persistent session from a snapshot
    pub fn restore(snapshot: SessionSnapshot, limits: SessionLimits, now: Instant) -> Self {
        let mut session = Session::new(snapshot.client_id.into(), false, limits);
        session.username = snapshot.username;
        session.mark_disconnected(now);

        for subscription in snapshot.subscriptions {
            session.add_subscription(subscription);
        }
        for entry in snapshot.inflight {
            session.outbound.restore(entry);
        }
        for packet_id in snapshot.awaiting_release {
            session.inbound.receive(packet_id, now);
        }
        session.queue.extend(snapshot.queued);
        session
    }
}

/// Copy of a session handed to hooks and used to restore sessions on start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub username: Option<String>,
    pub subscriptions: Vec<Subscription>,
    pub inflight: Vec<InflightEntry>,
    pub awaiting_release: Vec<u16>,
    pub queued: Vec<Publish>,
}

/// Thread-safe session store
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Create the session for `client_id` or resume the existing one.
    ///
    /// A clean session always replaces prior state. Returns the session and
    /// whether prior state was resumed (CONNACK session present).
    pub fn create_or_resume(
        &self,
        client_id: &Arc<str>,
        clean_session: bool,
    ) -> (Arc<RwLock<Session>>, bool) {
        let fresh = || {
            let session = Session::new(client_id.clone(), clean_session, self.limits);
            Arc::new(RwLock::new(session))
        };

        if clean_session {
            let session = fresh();
            self.sessions.insert(client_id.clone(), session.clone());
            return (session, false);
        }

        match self.sessions.entry(client_id.clone()) {
            Entry::Occupied(entry) => {
                let session = entry.get().clone();
                let resumed = {
                    let mut s = session.write();
                    let resumed = !s.clean_session;
                    s.clean_session = false;
                    s.mark_connected();
                    resumed
                };
                (session, resumed)
            }
            Entry::Vacant(entry) => {
                let session = fresh();
                entry.insert(session.clone());
                (session, false)
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn delete(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    /// Delete `client_id` only if it still maps to `session`
    pub fn delete_if_same(&self, client_id: &str, session: &Arc<RwLock<Session>>) -> bool {
        self.sessions
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Insert a session restored from storage unless one already exists
    pub fn restore(&self, session: Session) -> bool {
        match self.sessions.entry(session.client_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(RwLock::new(session)));
                true
            }
        }
    }

    /// Remove and return the ids of disconnected sessions past `expiry`
    pub fn remove_expired(&self, now: Instant, expiry: Option<Duration>) -> Vec<Arc<str>> {
        if expiry.is_none() {
            return Vec::new();
        }

        let candidates: Vec<Arc<str>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().read().is_expired(now, expiry))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|id| {
                self.sessions
                    .remove_if(id, |_, s| s.read().is_expired(now, expiry))
                    .is_some()
            })
            .collect()
    }

    /// Every session currently stored
    pub fn all(&self) -> Vec<Arc<RwLock<Session>>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limits(max_inflight: u16, max_queued: usize) -> SessionLimits {
        SessionLimits {
            max_inflight,
            max_queued,
            max_awaiting_rel: 16,
        }
    }

    fn qos1(payload: &'static str) -> Publish {
        Publish::new("t", payload, QoS::AtLeastOnce)
    }

    #[test]
    fn test_create_and_resume() {
        let store = SessionStore::default();
        let id: Arc<str> = "c1".into();

        let (session, present) = store.create_or_resume(&id, false);
        assert!(!present);
        session.write().add_subscription(Subscription {
            filter: "a/+".into(),
            qos: QoS::AtLeastOnce,
            retain_handling: RetainHandling::SendAtSubscribe,
        });
        session.write().mark_disconnected(Instant::now());

        let (resumed, present) = store.create_or_resume(&id, false);
        assert!(present);
        assert!(Arc::ptr_eq(&session, &resumed));
        assert!(resumed.read().is_connected());
        assert_eq!(resumed.read().subscriptions.len(), 1);
    }

    #[test]
    fn test_clean_session_discards_state() {
        let store = SessionStore::default();
        let id: Arc<str> = "c1".into();

        let (old, _) = store.create_or_resume(&id, false);
        old.write().outbound.allocate(&qos1("x")).unwrap();

        let (fresh, present) = store.create_or_resume(&id, true);
        assert!(!present);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.read().outbound.is_empty());

        // the next persistent connect does not resume the clean session's state
        let (_, present) = store.create_or_resume(&id, false);
        assert!(!present);
    }

    #[test]
    fn test_queue_drops_oldest() {
        let mut session = Session::new("c".into(), false, limits(10, 2));
        assert!(session.enqueue(qos1("1")).is_none());
        assert!(session.enqueue(qos1("2")).is_none());

        let dropped = session.enqueue(qos1("3")).unwrap();
        assert_eq!(dropped.payload, "1");
        assert_eq!(session.queued_len(), 2);
    }

    #[test]
    fn test_release_queued_respects_inflight_window() {
        let mut session = Session::new("c".into(), false, limits(2, 10));
        for payload in ["1", "2", "3"] {
            session.enqueue(qos1(payload));
        }

        let released = session.release_queued();
        let payloads: Vec<_> = released.iter().map(|p| p.payload.clone()).collect();
        assert_eq!(payloads, vec!["1", "2"]);
        assert_eq!(released[0].packet_id, Some(1));
        assert_eq!(session.queued_len(), 1);

        session.outbound.mark_sent(1, Instant::now());
        session.outbound.puback(1).unwrap();

        let released = session.release_queued();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].payload, "3");
        assert_eq!(released[0].packet_id, Some(1));
        assert!(!session.has_queued());
    }

    #[test]
    fn test_expiry() {
        let store = SessionStore::default();
        let now = Instant::now();
        let expiry = Some(Duration::from_secs(60));

        let (gone, _) = store.create_or_resume(&"gone".into(), false);
        gone.write().mark_disconnected(now);
        let (online, _) = store.create_or_resume(&"online".into(), false);
        drop(online);

        assert!(store.remove_expired(now + Duration::from_secs(59), expiry).is_empty());
        let expired = store.remove_expired(now + Duration::from_secs(60), expiry);
        assert_eq!(expired, vec![Arc::<str>::from("gone")]);
        assert_eq!(store.len(), 1);

        assert!(store.remove_expired(now + Duration::from_secs(3600), None).is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut session = Session::new("c".into(), false, limits(10, 10));
        session.add_subscription(Subscription {
            filter: "x/#".into(),
            qos: QoS::ExactlyOnce,
            retain_handling: RetainHandling::SendAtSubscribe,
        });
        let sent = session.outbound.allocate(&qos1("a")).unwrap();
        session.outbound.mark_sent(sent.packet_id.unwrap(), Instant::now());
        session.inbound.receive(9, Instant::now());
        session.enqueue(qos1("b"));

        let snapshot = session.snapshot();
        let restored = Session::restore(snapshot.clone(), limits(10, 10), Instant::now());

        assert!(!restored.is_connected());
        assert_eq!(restored.snapshot().subscriptions, snapshot.subscriptions);
        assert_eq!(restored.outbound.len(), 1);
        assert!(restored.inbound.is_awaiting(9));
        assert_eq!(restored.queued_len(), 1);
    }
}
