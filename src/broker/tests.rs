//! Broker routing and lifecycle tests

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use super::*;
use crate::hooks::{HookError, HookResult};
use crate::listeners::TcpListener;
use crate::protocol::ProtocolVersion;
use crate::session::OutboundState;

/// Register a live connection for `client_id` and return its outbound queue
fn connect(
    broker: &Broker,
    client_id: &str,
    clean_session: bool,
    capacity: usize,
) -> (mpsc::Receiver<Packet>, Arc<RwLock<Session>>) {
    let id: Arc<str> = Arc::from(client_id);
    let (session, _) = broker.sessions.create_or_resume(&id, clean_session);
    let (tx, rx) = mpsc::channel(capacity);
    let (kick, _) = watch::channel(None);
    let (_, closed) = watch::channel(false);
    let info = ClientInfo {
        id: id.clone(),
        listener: Arc::from("test"),
        remote_addr: "127.0.0.1:50000".into(),
        username: None,
        clean_session,
        protocol_version: ProtocolVersion::V311,
    };
    let handle = ClientHandle::new(
        info,
        session.clone(),
        tx,
        broker.next_connection_id(),
        kick,
        closed,
    );
    broker.clients.insert(id, handle);
    (rx, session)
}

fn subscribe(broker: &Broker, client_id: &str, filter: &str, qos: QoS) {
    broker.topics.subscribe(&Arc::from(client_id), filter, qos);
}

fn expect_publish(rx: &mut mpsc::Receiver<Packet>) -> Publish {
    match rx.try_recv() {
        Ok(Packet::Publish(publish)) => publish,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[derive(Default)]
struct EventCounter {
    dropped: Arc<AtomicUsize>,
    exhausted: Arc<AtomicUsize>,
}

#[async_trait]
impl Hook for EventCounter {
    fn id(&self) -> &str {
        "event-counter"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(
            event,
            HookEvent::OnPublishDropped | HookEvent::OnPacketIdExhausted
        )
    }

    async fn on_publish_dropped(&self, _client_id: &str, _publish: &Publish) -> HookResult<()> {
        self.dropped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_packet_id_exhausted(&self, _client_id: &str, _publish: &Publish) -> HookResult<()> {
        self.exhausted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RejectAll;

#[async_trait]
impl Hook for RejectAll {
    fn id(&self) -> &str {
        "reject-all"
    }

    fn provides(&self, event: HookEvent) -> bool {
        event == HookEvent::OnPublish
    }

    async fn on_publish(&self, _client: &ClientInfo, _publish: Publish) -> HookResult<Publish> {
        Err(HookError::Rejected)
    }
}

#[tokio::test]
async fn test_publish_reaches_live_subscriber() {
    let broker = Broker::new(BrokerConfig::default());
    let (mut rx, session) = connect(&broker, "c1", true, 16);
    subscribe(&broker, "c1", "sensors/+", QoS::AtLeastOnce);

    broker
        .publish("sensors/temp", "21.5", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let publish = expect_publish(&mut rx);
    assert_eq!(&*publish.topic, "sensors/temp");
    assert_eq!(&publish.payload[..], b"21.5");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert_eq!(publish.packet_id, Some(1));
    assert!(!publish.dup);

    let s = session.read();
    assert_eq!(s.outbound.get(1).map(|e| e.state), Some(OutboundState::AwaitingAck));
}

#[tokio::test]
async fn test_qos_is_min_of_publish_and_subscription() {
    let broker = Broker::new(BrokerConfig::default());
    let (mut rx, session) = connect(&broker, "c1", true, 16);
    subscribe(&broker, "c1", "a/#", QoS::AtMostOnce);

    broker.publish("a/b", "x", QoS::ExactlyOnce, false).await.unwrap();

    let publish = expect_publish(&mut rx);
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
    assert!(session.read().outbound.is_empty());
}

#[tokio::test]
async fn test_no_subscribers_is_not_an_error() {
    let broker = Broker::new(BrokerConfig::default());
    broker.publish("nobody/listens", "x", QoS::AtLeastOnce, false).await.unwrap();
    assert_eq!(broker.subscriber_count(), 0);
}

#[tokio::test]
async fn test_wildcard_publish_topic_rejected() {
    let broker = Broker::new(BrokerConfig::default());
    let result = broker.publish("a/+", "x", QoS::AtMostOnce, false).await;
    assert!(matches!(result, Err(BrokerError::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_offline_session_queues_qos1_and_drops_qos0() {
    let broker = Broker::new(BrokerConfig::default());
    let id: Arc<str> = Arc::from("offline");
    let (session, _) = broker.sessions.create_or_resume(&id, false);
    session.write().mark_disconnected(Instant::now());
    subscribe(&broker, "offline", "jobs/#", QoS::AtLeastOnce);

    broker.publish("jobs/1", "one", QoS::AtLeastOnce, false).await.unwrap();
    broker.publish("jobs/2", "two", QoS::AtMostOnce, false).await.unwrap();
    broker.publish("jobs/3", "three", QoS::AtLeastOnce, false).await.unwrap();

    let mut s = session.write();
    assert_eq!(s.queued_len(), 2);
    let released = s.release_queued();
    let topics: Vec<&str> = released.iter().map(|p| &*p.topic).collect();
    assert_eq!(topics, vec!["jobs/1", "jobs/3"]);
    assert_eq!(released[0].packet_id, Some(1));
    assert_eq!(released[1].packet_id, Some(2));
}

#[tokio::test]
async fn test_handle_of_replaced_session_is_not_live() {
    let broker = Broker::new(BrokerConfig::default());
    let (mut old_rx, _) = connect(&broker, "c1", true, 16);
    subscribe(&broker, "c1", "t", QoS::AtLeastOnce);

    // A clean reconnect replaced the session before the new handle exists
    let id: Arc<str> = Arc::from("c1");
    let (fresh, _) = broker.sessions.create_or_resume(&id, true);

    broker.publish("t", "x", QoS::AtLeastOnce, false).await.unwrap();

    assert!(old_rx.try_recv().is_err());
    assert_eq!(fresh.read().queued_len(), 1);
}

#[tokio::test]
async fn test_full_queue_drops_qos0() {
    let broker = Broker::new(BrokerConfig::default());
    let counter = EventCounter::default();
    let dropped = counter.dropped.clone();
    broker.add_hook(counter, None).unwrap();

    let (mut rx, _) = connect(&broker, "slow", true, 1);
    subscribe(&broker, "slow", "t", QoS::AtMostOnce);

    broker.publish("t", "first", QoS::AtMostOnce, false).await.unwrap();
    broker.publish("t", "second", QoS::AtMostOnce, false).await.unwrap();

    assert_eq!(&expect_publish(&mut rx).payload[..], b"first");
    assert!(rx.try_recv().is_err());
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_full_queue_leaves_qos1_for_retry() {
    let broker = Broker::new(BrokerConfig::default());
    let (mut rx, session) = connect(&broker, "slow", true, 1);
    subscribe(&broker, "slow", "t", QoS::AtLeastOnce);

    broker.publish("t", "first", QoS::AtLeastOnce, false).await.unwrap();
    broker.publish("t", "second", QoS::AtLeastOnce, false).await.unwrap();

    assert_eq!(
        session.read().outbound.get(2).map(|e| e.state),
        Some(OutboundState::PendingSend)
    );

    assert_eq!(expect_publish(&mut rx).packet_id, Some(1));
    broker.retry_inflight().await;

    let retried = expect_publish(&mut rx);
    assert_eq!(retried.packet_id, Some(2));
    assert_eq!(&retried.payload[..], b"second");
    assert!(!retried.dup);
    assert_eq!(
        session.read().outbound.get(2).map(|e| e.state),
        Some(OutboundState::AwaitingAck)
    );
}

#[tokio::test]
async fn test_messages_behind_a_full_queue_keep_their_order() {
    let broker = Broker::new(BrokerConfig::default());
    let (mut rx, session) = connect(&broker, "slow", true, 1);
    subscribe(&broker, "slow", "t", QoS::AtLeastOnce);

    broker.publish("t", "m1", QoS::AtLeastOnce, false).await.unwrap();
    broker.publish("t", "m2", QoS::AtLeastOnce, false).await.unwrap();
    assert_eq!(&expect_publish(&mut rx).payload[..], b"m1");

    // Room in the queue again, but m2 is still waiting for the retry task
    broker.publish("t", "m3", QoS::AtLeastOnce, false).await.unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(session.read().queued_len(), 1);

    broker.retry_inflight().await;
    assert_eq!(&expect_publish(&mut rx).payload[..], b"m2");
    assert!(rx.try_recv().is_err());

    broker.retry_inflight().await;
    let m3 = expect_publish(&mut rx);
    assert_eq!(&m3.payload[..], b"m3");
    assert!(!m3.dup);

    let s = session.read();
    assert!(!s.has_queued());
    assert!(!s.outbound.has_pending_send());
}

#[tokio::test]
async fn test_refused_resend_leaves_entry_untouched() {
    let config = BrokerConfig {
        inflight_ttl: Duration::ZERO,
        ..Default::default()
    };
    let broker = Broker::new(config);
    let (mut rx, session) = connect(&broker, "slow", true, 1);
    subscribe(&broker, "slow", "t", QoS::AtLeastOnce);

    broker.publish("t", "m1", QoS::AtLeastOnce, false).await.unwrap();
    assert_eq!(expect_publish(&mut rx).packet_id, Some(1));
    broker.publish("t", "m2", QoS::AtLeastOnce, false).await.unwrap();
    assert_eq!(expect_publish(&mut rx).packet_id, Some(2));

    // Both are due; only the first fits in the queue
    broker.retry_inflight().await;
    let resent = expect_publish(&mut rx);
    assert_eq!(resent.packet_id, Some(1));
    assert!(resent.dup);

    let s = session.read();
    let first = s.outbound.get(1).unwrap();
    assert_eq!(first.retry_count, 1);
    assert!(first.publish.dup);
    let second = s.outbound.get(2).unwrap();
    assert_eq!(second.retry_count, 0);
    assert!(!second.publish.dup);
}

#[tokio::test]
async fn test_unacked_message_resent_with_dup() {
    let config = BrokerConfig {
        inflight_ttl: Duration::ZERO,
        ..Default::default()
    };
    let broker = Broker::new(config);
    let (mut rx, _) = connect(&broker, "c1", true, 16);
    subscribe(&broker, "c1", "t", QoS::AtLeastOnce);

    broker.publish("t", "x", QoS::AtLeastOnce, false).await.unwrap();
    assert!(!expect_publish(&mut rx).dup);

    broker.retry_inflight().await;
    let resent = expect_publish(&mut rx);
    assert!(resent.dup);
    assert_eq!(resent.packet_id, Some(1));
}

#[tokio::test]
async fn test_exhausted_packet_ids_queue_message() {
    let config = BrokerConfig {
        max_inflight: 1,
        ..Default::default()
    };
    let broker = Broker::new(config);
    let counter = EventCounter::default();
    let exhausted = counter.exhausted.clone();
    broker.add_hook(counter, None).unwrap();

    let (mut rx, session) = connect(&broker, "c1", true, 16);
    subscribe(&broker, "c1", "t", QoS::AtLeastOnce);

    broker.publish("t", "a", QoS::AtLeastOnce, false).await.unwrap();
    broker.publish("t", "b", QoS::AtLeastOnce, false).await.unwrap();
    broker.publish("t", "c", QoS::AtLeastOnce, false).await.unwrap();

    assert_eq!(expect_publish(&mut rx).packet_id, Some(1));
    assert!(rx.try_recv().is_err());
    assert_eq!(exhausted.load(Ordering::SeqCst), 1);

    let mut s = session.write();
    // Later messages queue behind the first one to keep their order
    assert_eq!(s.queued_len(), 2);
    assert!(s.outbound.puback(1).is_some());
    let released = s.release_queued();
    assert_eq!(released.len(), 1);
    assert_eq!(&released[0].payload[..], b"b");
    assert_eq!(released[0].packet_id, Some(1));
}

#[tokio::test]
async fn test_retained_message_stored_and_cleared() {
    let broker = Broker::new(BrokerConfig::default());
    let (mut rx, _) = connect(&broker, "c1", true, 16);
    subscribe(&broker, "c1", "status/#", QoS::AtLeastOnce);

    broker.publish("status/a", "online", QoS::AtMostOnce, true).await.unwrap();
    assert_eq!(broker.retained_count(), 1);

    // Live subscribers get the message without the RETAIN flag
    let forwarded = expect_publish(&mut rx);
    assert!(!forwarded.retain);

    broker.publish("status/a", "", QoS::AtMostOnce, true).await.unwrap();
    assert_eq!(broker.retained_count(), 0);
}

#[tokio::test]
async fn test_retain_disabled() {
    let config = BrokerConfig {
        retain_available: false,
        ..Default::default()
    };
    let broker = Broker::new(config);
    broker.publish("status/a", "online", QoS::AtMostOnce, true).await.unwrap();
    assert_eq!(broker.retained_count(), 0);
}

#[tokio::test]
async fn test_rejected_internal_publish_is_not_routed() {
    let broker = Broker::new(BrokerConfig::default());
    broker.add_hook(RejectAll, None).unwrap();
    let (mut rx, _) = connect(&broker, "c1", true, 16);
    subscribe(&broker, "c1", "t", QoS::AtMostOnce);

    broker.publish("t", "x", QoS::AtMostOnce, false).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_expired_sessions_removed_with_subscriptions() {
    let config = BrokerConfig {
        session_expiry: Some(Duration::ZERO),
        ..Default::default()
    };
    let broker = Broker::new(config);

    let gone: Arc<str> = Arc::from("gone");
    let (session, _) = broker.sessions.create_or_resume(&gone, false);
    session.write().mark_disconnected(Instant::now());
    subscribe(&broker, "gone", "a/b", QoS::AtLeastOnce);

    let (_rx, _) = connect(&broker, "online", false, 16);
    subscribe(&broker, "online", "a/b", QoS::AtLeastOnce);

    broker.expire_sessions().await;

    assert_eq!(broker.session_count(), 1);
    assert!(broker.sessions.get("gone").is_none());
    assert_eq!(broker.subscriber_count(), 1);
}

#[tokio::test]
async fn test_sessions_never_expire_without_expiry() {
    let broker = Broker::new(BrokerConfig::default());
    let id: Arc<str> = Arc::from("kept");
    let (session, _) = broker.sessions.create_or_resume(&id, false);
    session.write().mark_disconnected(Instant::now());

    broker.expire_sessions().await;
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test]
async fn test_duplicate_listener_id_rejected() {
    let broker = Arc::new(Broker::new(BrokerConfig::default()));
    broker
        .add_listener(Arc::new(TcpListener::new("tcp1", "127.0.0.1:0")))
        .await
        .unwrap();

    let result = broker
        .add_listener(Arc::new(TcpListener::new("tcp1", "127.0.0.1:0")))
        .await;
    assert!(matches!(result, Err(BrokerError::DuplicateListener(id)) if id == "tcp1"));
    assert_eq!(broker.listener_ids(), vec!["tcp1".to_string()]);

    broker.close().await;
}

#[tokio::test]
async fn test_close_listener_kicks_its_clients() {
    let broker = Arc::new(Broker::new(BrokerConfig::default()));
    broker
        .add_listener(Arc::new(TcpListener::new("test", "127.0.0.1:0")))
        .await
        .unwrap();

    let (_rx, _) = connect(&broker, "c1", true, 16);

    assert!(broker.close_listener("test"));
    assert!(!broker.close_listener("missing"));
    let handle = broker.clients.get("c1").unwrap();
    assert_eq!(handle.kick_reason(), Some(Kick::ServerClosing));
}

#[tokio::test]
async fn test_closed_broker_refuses_to_serve() {
    let broker = Arc::new(Broker::new(BrokerConfig::default()));
    broker.close().await;
    assert!(matches!(broker.serve().await, Err(BrokerError::ServerClosing)));
}
