//! Debug hook: logs every observational event at debug level

use std::any::Any;

use async_trait::async_trait;
use tracing::debug;

use super::{ClientInfo, Hook, HookError, HookEvent, HookResult, SubscribeRequest};
use crate::error::BrokerError;
use crate::protocol::{Connect, Publish, SubAckReturnCode};
use crate::retained::{RetainAction, RetainedMessage};
use crate::session::SessionSnapshot;

/// Options for [`DebugHook`]
#[derive(Debug, Clone, Default)]
pub struct DebugOptions {
    /// Log message payloads (lossy UTF-8)
    pub show_payloads: bool,
}

#[derive(Debug, Default)]
pub struct DebugHook {
    options: DebugOptions,
}

impl DebugHook {
    pub fn new() -> Self {
        Self::default()
    }

    fn payload(&self, publish: &Publish) -> String {
        if self.options.show_payloads {
            String::from_utf8_lossy(&publish.payload).into_owned()
        } else {
            format!("<{} bytes>", publish.payload.len())
        }
    }
}

#[async_trait]
impl Hook for DebugHook {
    fn id(&self) -> &str {
        "debug"
    }

    fn provides(&self, event: HookEvent) -> bool {
        !matches!(
            event,
            HookEvent::OnConnectAuthenticate
                | HookEvent::OnAclCheck
                | HookEvent::StoredSessions
                | HookEvent::StoredRetainedMessages
        )
    }

    fn init(&mut self, options: Option<&(dyn Any + Send + Sync)>) -> HookResult<()> {
        if let Some(options) = options {
            let options = options
                .downcast_ref::<DebugOptions>()
                .ok_or_else(|| HookError::InvalidOptions("expected DebugOptions".into()))?;
            self.options = options.clone();
        }
        Ok(())
    }

    async fn on_started(&self) -> HookResult<()> {
        debug!("broker started");
        Ok(())
    }

    async fn on_stopped(&self) -> HookResult<()> {
        debug!("broker stopped");
        Ok(())
    }

    async fn on_connect(&self, client: &ClientInfo, connect: &Connect) -> HookResult<()> {
        debug!(
            client_id = %client.id,
            listener = %client.listener,
            remote = %client.remote_addr,
            username = ?connect.username,
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            "client connecting"
        );
        Ok(())
    }

    async fn on_session_established(
        &self,
        client: &ClientInfo,
        session_present: bool,
    ) -> HookResult<()> {
        debug!(client_id = %client.id, session_present, "session established");
        Ok(())
    }

    async fn on_disconnect(
        &self,
        client: &ClientInfo,
        error: Option<&BrokerError>,
        expire: bool,
    ) -> HookResult<()> {
        match error {
            Some(e) => debug!(client_id = %client.id, error = %e, expire, "client disconnected"),
            None => debug!(client_id = %client.id, expire, "client disconnected"),
        }
        Ok(())
    }

    async fn on_subscribe(
        &self,
        client: &ClientInfo,
        requests: Vec<SubscribeRequest>,
    ) -> HookResult<Vec<SubscribeRequest>> {
        let filters: Vec<&str> = requests.iter().map(|r| r.filter.as_str()).collect();
        debug!(client_id = %client.id, ?filters, "subscribe received");
        Ok(requests)
    }

    async fn on_subscribed(
        &self,
        client: &ClientInfo,
        requests: &[SubscribeRequest],
        return_codes: &[SubAckReturnCode],
    ) -> HookResult<()> {
        for (request, code) in requests.iter().zip(return_codes) {
            debug!(client_id = %client.id, filter = %request.filter, ?code, "subscribed");
        }
        Ok(())
    }

    async fn on_unsubscribed(&self, client: &ClientInfo, filters: &[String]) -> HookResult<()> {
        debug!(client_id = %client.id, ?filters, "unsubscribed");
        Ok(())
    }

    async fn on_publish(&self, client: &ClientInfo, publish: Publish) -> HookResult<Publish> {
        debug!(
            client_id = %client.id,
            topic = %publish.topic,
            qos = publish.qos as u8,
            retain = publish.retain,
            payload = %self.payload(&publish),
            "publish received"
        );
        Ok(publish)
    }

    async fn on_published(&self, client: &ClientInfo, publish: &Publish) -> HookResult<()> {
        debug!(client_id = %client.id, topic = %publish.topic, "published");
        Ok(())
    }

    async fn on_publish_dropped(&self, client_id: &str, publish: &Publish) -> HookResult<()> {
        debug!(client_id, topic = %publish.topic, qos = publish.qos as u8, "publish dropped");
        Ok(())
    }

    async fn on_retain_message(
        &self,
        message: &RetainedMessage,
        action: RetainAction,
    ) -> HookResult<()> {
        debug!(topic = %message.topic, ?action, "retained message");
        Ok(())
    }

    async fn on_qos_publish(
        &self,
        client_id: &str,
        publish: &Publish,
        resends: u32,
    ) -> HookResult<()> {
        debug!(
            client_id,
            packet_id = ?publish.packet_id,
            topic = %publish.topic,
            resends,
            "qos publish sent"
        );
        Ok(())
    }

    async fn on_qos_complete(&self, client_id: &str, packet_id: u16) -> HookResult<()> {
        debug!(client_id, packet_id, "qos flow complete");
        Ok(())
    }

    async fn on_packet_id_exhausted(&self, client_id: &str, publish: &Publish) -> HookResult<()> {
        debug!(client_id, topic = %publish.topic, "packet ids exhausted");
        Ok(())
    }

    async fn on_will_sent(&self, client: &ClientInfo, will: &Publish) -> HookResult<()> {
        debug!(client_id = %client.id, topic = %will.topic, "will sent");
        Ok(())
    }

    async fn on_session_persist(&self, snapshot: &SessionSnapshot) -> HookResult<()> {
        debug!(
            client_id = %snapshot.client_id,
            subscriptions = snapshot.subscriptions.len(),
            inflight = snapshot.inflight.len(),
            queued = snapshot.queued.len(),
            "session persisted"
        );
        Ok(())
    }

    async fn on_client_expired(&self, client_id: &str) -> HookResult<()> {
        debug!(client_id, "client expired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    #[test]
    fn test_provides_observational_events_only() {
        let hook = DebugHook::new();
        assert!(hook.provides(HookEvent::OnPublished));
        assert!(hook.provides(HookEvent::OnPublish));
        assert!(!hook.provides(HookEvent::OnConnectAuthenticate));
        assert!(!hook.provides(HookEvent::StoredSessions));
    }

    #[tokio::test]
    async fn test_publish_passes_through() {
        let mut hook = DebugHook::new();
        hook.init(Some(&DebugOptions { show_payloads: true })).unwrap();

        let publish = Publish::new("a/b", "hello", QoS::AtLeastOnce);
        let out = hook
            .on_publish(&ClientInfo::internal(), publish.clone())
            .await
            .unwrap();
        assert_eq!(out, publish);
        assert_eq!(hook.payload(&publish), "hello");
    }

    #[test]
    fn test_payload_hidden_by_default() {
        let hook = DebugHook::new();
        let publish = Publish::new("a/b", "hello", QoS::AtMostOnce);
        assert_eq!(hook.payload(&publish), "<5 bytes>");
    }
}
