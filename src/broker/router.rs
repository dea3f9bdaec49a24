//! Message Router
//!
//! Fans a publish out to every matching subscriber. Delivery to one client
//! happens under that client's session lock so that a message is either
//! handed to the live connection or queued, never lost between the two
//! while the client is reconnecting.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::Broker;
use crate::hooks::ClientInfo;
use crate::protocol::{Packet, Publish, QoS};
use crate::retained::RetainedMessage;
use crate::session::Session;

/// Hook events collected under a session lock, emitted after it is released
pub(crate) enum Delivery {
    Sent(Publish),
    Dropped(Publish),
    Exhausted(Publish),
}

impl Broker {
    /// Retain (if flagged) and deliver `publish` to every matching subscriber
    pub(crate) async fn route(&self, origin: &ClientInfo, publish: Publish) {
        if publish.retain && self.config.retain_available {
            let message = RetainedMessage::from_publish(&publish);
            let action = self.retained.set(message.clone());
            self.hooks.on_retain_message(&message, action).await;
        }

        // Forwarded copies never carry RETAIN; that flag is reserved for
        // messages sent because of a new subscription.
        let outgoing = Publish {
            dup: false,
            retain: false,
            packet_id: None,
            ..publish.clone()
        };

        let subscribers = self.topics.matches(&publish.topic);
        debug!(topic = %publish.topic, subscribers = subscribers.len(), "routing publish");

        for subscriber in subscribers {
            let mut copy = outgoing.clone();
            copy.qos = publish.qos.min(subscriber.qos);
            self.deliver(&subscriber.client_id, copy).await;
        }

        self.hooks.on_published(origin, &publish).await;
    }

    /// Sender of the live connection owning `session`, if any.
    ///
    /// Must be called with the session lock held.
    fn live_sender(
        &self,
        client_id: &str,
        session: &Arc<RwLock<Session>>,
    ) -> Option<mpsc::Sender<Packet>> {
        self.clients
            .get(client_id)
            .filter(|handle| Arc::ptr_eq(&handle.session, session))
            .map(|handle| handle.outbound.clone())
    }

    /// Deliver one message at its final QoS to one client.
    ///
    /// Never waits on the client's outbound queue: a QoS 0 message that
    /// finds it full is dropped, a QoS 1/2 message stays in the in-flight
    /// table and is sent by the retry task. Later QoS 1/2 messages queue
    /// behind it until then.
    pub(crate) async fn deliver(&self, client_id: &Arc<str>, publish: Publish) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };

        let mut events = Vec::new();
        {
            let mut s = session.write();
            let live = self.live_sender(client_id, &session);

            match (publish.qos, live) {
                (QoS::AtMostOnce, Some(outbound)) => {
                    if let Err(TrySendError::Full(Packet::Publish(p))) =
                        outbound.try_send(Packet::Publish(publish))
                    {
                        events.push(Delivery::Dropped(p));
                    }
                }
                // QoS 0 is never kept for an offline client
                (QoS::AtMostOnce, None) => {}
                (_, Some(outbound)) => {
                    if let Some(out) = stage_outbound(&mut s, publish, &mut events) {
                        let packet_id = out.packet_id.unwrap_or_default();
                        match outbound.try_send(Packet::Publish(out.clone())) {
                            Ok(()) => {
                                s.outbound.mark_sent(packet_id, Instant::now());
                                events.push(Delivery::Sent(out));
                            }
                            Err(_) => {
                                debug!(
                                    client_id = %client_id,
                                    packet_id,
                                    "outbound queue full, left for retry"
                                );
                            }
                        }
                    }
                }
                (_, None) => {
                    if let Some(dropped) = s.enqueue(publish) {
                        events.push(Delivery::Dropped(dropped));
                    }
                }
            }
        }

        self.emit_deliveries(client_id, events).await;
    }

    pub(crate) async fn emit_deliveries(&self, client_id: &str, events: Vec<Delivery>) {
        for event in events {
            match event {
                Delivery::Sent(publish) => {
                    self.hooks.on_qos_publish(client_id, &publish, 0).await;
                }
                Delivery::Dropped(publish) => {
                    warn!(
                        client_id,
                        topic = %publish.topic,
                        qos = publish.qos as u8,
                        "message dropped"
                    );
                    self.hooks.on_publish_dropped(client_id, &publish).await;
                }
                Delivery::Exhausted(publish) => {
                    warn!(client_id, topic = %publish.topic, "no free packet id, message queued");
                    self.hooks.on_packet_id_exhausted(client_id, &publish).await;
                }
            }
        }
    }
}

/// Register a QoS 1/2 message in the in-flight table.
///
/// Returns the message with its packet id when it can go out now. It is
/// queued instead when older messages are still queued or waiting for room
/// in the outbound queue, or when no packet id is free.
pub(crate) fn stage_outbound(
    session: &mut Session,
    publish: Publish,
    events: &mut Vec<Delivery>,
) -> Option<Publish> {
    if session.has_queued() || session.outbound.has_pending_send() {
        if let Some(dropped) = session.enqueue(publish) {
            events.push(Delivery::Dropped(dropped));
        }
        return None;
    }

    match session.outbound.allocate(&publish) {
        Ok(out) => Some(out),
        Err(_) => {
            if let Some(dropped) = session.enqueue(publish.clone()) {
                events.push(Delivery::Dropped(dropped));
            }
            events.push(Delivery::Exhausted(publish));
            None
        }
    }
}
