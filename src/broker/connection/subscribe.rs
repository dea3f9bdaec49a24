//! SUBSCRIBE and UNSUBSCRIBE handling

use tracing::debug;

use super::Connection;
use crate::error::BrokerError;
use crate::hooks::{Access, SubscribeRequest};
use crate::protocol::{
    Packet, QoS, RetainHandling, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic::validate_topic_filter;

impl Connection {
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<(), BrokerError> {
        let max_qos = self.broker.config.max_qos;
        let requests: Vec<SubscribeRequest> = subscribe
            .filters
            .iter()
            .map(|f| {
                let mut request = SubscribeRequest::new(f.filter.clone(), f.qos.min(max_qos));
                request.denied = validate_topic_filter(&f.filter).is_err();
                request
            })
            .collect();

        let requests = self.broker.hooks.on_subscribe(&self.info, requests).await;

        let mut return_codes = Vec::with_capacity(requests.len());
        let mut retained: Vec<(String, QoS)> = Vec::new();

        for request in &requests {
            if request.denied || validate_topic_filter(&request.filter).is_err() {
                debug!(client_id = %self.info.id, filter = %request.filter, "subscription refused");
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            if !self
                .broker
                .hooks
                .on_acl_check(&self.info, &request.filter, Access::Read)
                .await
            {
                debug!(
                    client_id = %self.info.id,
                    filter = %request.filter,
                    error = %BrokerError::AclRejected,
                    "subscription refused"
                );
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let is_new = self
                .broker
                .topics
                .subscribe(&self.info.id, &request.filter, request.qos);
            self.session.write().add_subscription(request.to_subscription());
            return_codes.push(SubAckReturnCode::Granted(request.qos));

            let send_retained = match request.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendIfNew => is_new,
                RetainHandling::DoNotSend => false,
            };
            if send_retained {
                retained.push((request.filter.clone(), request.qos));
            }
        }

        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: return_codes.clone(),
        }))
        .await?;

        self.broker
            .hooks
            .on_subscribed(&self.info, &requests, &return_codes)
            .await;
        self.persist_session().await;

        if self.broker.config.retain_available {
            for (filter, granted) in retained {
                for message in self.broker.retained.match_all(&filter) {
                    self.send_publish(message.to_publish(granted)).await?;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), BrokerError> {
        for filter in &unsubscribe.filters {
            let removed = self.broker.topics.unsubscribe(&self.info.id, filter);
            self.session.write().remove_subscription(filter);
            if !removed {
                debug!(
                    client_id = %self.info.id,
                    filter = %filter,
                    "unsubscribe for unknown filter"
                );
            }
        }

        // UNSUBACK is sent whether or not the filters existed
        self.send(Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
            .await?;

        self.broker
            .hooks
            .on_unsubscribed(&self.info, &unsubscribe.filters)
            .await;
        self.persist_session().await;
        Ok(())
    }
}
