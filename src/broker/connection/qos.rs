//! QoS acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP) and
//! outbound sends that go through the in-flight table

use std::time::Instant;

use tracing::{debug, info, trace};

use super::Connection;
use crate::broker::router::{stage_outbound, Delivery};
use crate::error::BrokerError;
use crate::protocol::{Packet, PubComp, PubRel, Publish, QoS};
use crate::session::{PubRecOutcome, Session};

impl Connection {
    /// First step after CONNACK: resend what a resumed session still owes
    /// the client, then release its queue.
    pub(crate) async fn start(&mut self, session_present: bool) -> Result<(), BrokerError> {
        let now = Instant::now();
        let (resends, released) = {
            let mut s = self.session.write();
            s.mark_connected();
            let resends = s.outbound.resend_all();
            for (packet_id, _) in &resends {
                s.outbound.mark_sent(*packet_id, now);
            }
            (resends, take_released(&mut s, now))
        };

        if !resends.is_empty() || !released.is_empty() {
            info!(
                client_id = %self.info.id,
                session_present,
                inflight = resends.len(),
                queued = released.len(),
                "delivering pending messages"
            );
        }

        for (_, resend) in resends {
            self.send(resend.into_packet()).await?;
        }
        self.send_released(released).await?;

        self.broker
            .hooks
            .on_session_established(&self.info, session_present)
            .await;
        self.persist_session().await;
        Ok(())
    }

    pub(crate) async fn handle_puback(&mut self, packet_id: u16) -> Result<(), BrokerError> {
        let completed = self.session.write().outbound.puback(packet_id);
        match completed {
            Some(_) => self.complete(packet_id).await,
            None => {
                debug!(client_id = %self.info.id, packet_id, "PUBACK for unknown packet id");
                Ok(())
            }
        }
    }

    pub(crate) async fn handle_pubrec(&mut self, packet_id: u16) -> Result<(), BrokerError> {
        let outcome = self
            .session
            .write()
            .outbound
            .pubrec(packet_id, Instant::now());

        match outcome {
            PubRecOutcome::Released | PubRecOutcome::AlreadyReleased => {
                self.send(Packet::PubRel(PubRel::new(packet_id))).await
            }
            PubRecOutcome::Unknown => {
                debug!(client_id = %self.info.id, packet_id, "PUBREC for unknown packet id");
                Ok(())
            }
        }
    }

    /// PUBCOMP is sent even for an unknown id so a client retrying an
    /// exchange the broker already finished can complete it.
    pub(crate) async fn handle_pubrel(&mut self, packet_id: u16) -> Result<(), BrokerError> {
        let released = self.session.write().inbound.release(packet_id);
        if !released {
            debug!(client_id = %self.info.id, packet_id, "PUBREL for unknown packet id");
        }
        self.send(Packet::PubComp(PubComp::new(packet_id))).await
    }

    pub(crate) async fn handle_pubcomp(&mut self, packet_id: u16) -> Result<(), BrokerError> {
        let completed = self.session.write().outbound.pubcomp(packet_id);
        match completed {
            Some(_) => self.complete(packet_id).await,
            None => {
                debug!(client_id = %self.info.id, packet_id, "PUBCOMP for unknown packet id");
                Ok(())
            }
        }
    }

    /// A packet id was freed: report it and move queued messages into it
    async fn complete(&self, packet_id: u16) -> Result<(), BrokerError> {
        trace!(client_id = %self.info.id, packet_id, "qos flow complete");
        self.broker
            .hooks
            .on_qos_complete(&self.info.id, packet_id)
            .await;

        let released = {
            let mut s = self.session.write();
            take_released(&mut s, Instant::now())
        };
        self.send_released(released).await
    }

    /// Send a message on this connection. QoS 1/2 messages take a packet id
    /// first, or wait in the session queue when none is free.
    pub(crate) async fn send_publish(&self, publish: Publish) -> Result<(), BrokerError> {
        if publish.qos == QoS::AtMostOnce {
            return self.send(Packet::Publish(publish)).await;
        }

        let mut events = Vec::new();
        let staged = {
            let mut s = self.session.write();
            let staged = stage_outbound(&mut s, publish, &mut events);
            if let Some(packet_id) = staged.as_ref().and_then(|p| p.packet_id) {
                s.outbound.mark_sent(packet_id, Instant::now());
            }
            staged
        };

        if let Some(publish) = staged {
            self.send(Packet::Publish(publish.clone())).await?;
            events.push(Delivery::Sent(publish));
        }
        self.broker.emit_deliveries(&self.info.id, events).await;
        Ok(())
    }

    async fn send_released(&self, released: Vec<Publish>) -> Result<(), BrokerError> {
        for publish in released {
            self.send(Packet::Publish(publish.clone())).await?;
            if publish.qos != QoS::AtMostOnce {
                self.broker
                    .hooks
                    .on_qos_publish(&self.info.id, &publish, 0)
                    .await;
            }
        }
        Ok(())
    }
}

/// Messages that can go out now, in publish order: entries that found the
/// outbound queue full earlier, then released queued messages. They are
/// marked sent before the lock is dropped, so the retry task does not pick
/// them up a second time.
fn take_released(session: &mut Session, now: Instant) -> Vec<Publish> {
    let mut released = session.outbound.pending_sends();
    released.extend(session.release_queued());
    for packet_id in released.iter().filter_map(|p| p.packet_id) {
        session.outbound.mark_sent(packet_id, now);
    }
    released
}
