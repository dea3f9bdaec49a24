//! Inbound PUBLISH handling

use std::time::Instant;

use tracing::{debug, warn};

use super::Connection;
use crate::error::BrokerError;
use crate::hooks::Access;
use crate::protocol::{Packet, PubAck, PubRec, Publish, QoS};
use crate::session::InboundReceive;
use crate::topic::validate_topic_name;

impl Connection {
    pub(crate) async fn handle_publish(&mut self, publish: Publish) -> Result<(), BrokerError> {
        validate_topic_name(&publish.topic)
            .map_err(|e| BrokerError::ProtocolViolation(format!("publish topic: {}", e)))?;

        match publish.qos {
            QoS::AtMostOnce => {
                self.process_publish(publish).await;
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = require_packet_id(&publish)?;
                self.process_publish(publish).await;
                self.send(Packet::PubAck(PubAck::new(packet_id))).await
            }
            QoS::ExactlyOnce => {
                let packet_id = require_packet_id(&publish)?;
                let receive = self
                    .session
                    .write()
                    .inbound
                    .receive(packet_id, Instant::now());

                match receive {
                    InboundReceive::New => {
                        self.process_publish(publish).await;
                        self.send(Packet::PubRec(PubRec::new(packet_id))).await
                    }
                    // Already routed on first receipt, only acknowledge again
                    InboundReceive::Duplicate => {
                        debug!(client_id = %self.info.id, packet_id, "duplicate QoS 2 publish");
                        self.send(Packet::PubRec(PubRec::new(packet_id))).await
                    }
                    InboundReceive::Full => {
                        warn!(
                            client_id = %self.info.id,
                            packet_id,
                            "too many QoS 2 messages awaiting release, publish dropped"
                        );
                        self.broker
                            .hooks
                            .on_publish_dropped(&self.info.id, &publish)
                            .await;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Write ACL check, `OnPublish` hooks, then fan-out.
    ///
    /// A rejected message is dropped silently; the sender still gets the
    /// acknowledgement its QoS requires.
    async fn process_publish(&self, publish: Publish) {
        let hooks = &self.broker.hooks;
        if !hooks
            .on_acl_check(&self.info, &publish.topic, Access::Write)
            .await
        {
            debug!(
                client_id = %self.info.id,
                topic = %publish.topic,
                error = %BrokerError::AclRejected,
                "publish not routed"
            );
            return;
        }

        match hooks.on_publish(&self.info, publish).await {
            Some(publish) => self.broker.route(&self.info, publish).await,
            None => debug!(client_id = %self.info.id, "publish rejected by hooks"),
        }
    }
}

fn require_packet_id(publish: &Publish) -> Result<u16, BrokerError> {
    publish
        .packet_id
        .ok_or_else(|| BrokerError::ProtocolViolation("QoS > 0 publish without packet id".into()))
}
