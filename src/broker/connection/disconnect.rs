//! Connection teardown: registry, session, will and hooks

use std::time::Instant;

use tracing::{debug, info};

use super::Connection;
use crate::error::BrokerError;
use crate::hooks::Access;
use crate::protocol::Will;

impl Connection {
    /// Clean up after the read loop ended and pass its result through.
    ///
    /// The will is published when the connection ended without DISCONNECT,
    /// unless a newer connection took the session over.
    pub(crate) async fn finish(self, result: Result<(), BrokerError>) -> Result<(), BrokerError> {
        let broker = &self.broker;
        let client_id = &self.info.id;

        broker
            .clients
            .remove_if(client_id, |_, handle| handle.connection_id == self.connection_id);

        let (will, snapshot, expire) = {
            let mut s = self.session.write();
            let will = s.will.take();
            s.mark_disconnected(Instant::now());
            if s.clean_session {
                (will, None, true)
            } else {
                (will, Some(s.snapshot()), false)
            }
        };

        if expire && broker.sessions.delete_if_same(client_id, &self.session) {
            broker.topics.remove_client(client_id);
        }

        let send_will = !matches!(result, Ok(()) | Err(BrokerError::SessionTakenOver));
        if let Some(will) = will.filter(|_| send_will) {
            self.publish_will(will).await;
        }

        match &result {
            Ok(()) => info!(client_id = %client_id, expire, "client disconnected"),
            Err(e) => info!(client_id = %client_id, error = %e, expire, "connection closed"),
        }

        broker
            .hooks
            .on_disconnect(&self.info, result.as_ref().err(), expire)
            .await;
        if let Some(snapshot) = snapshot {
            broker.hooks.on_session_persist(&snapshot).await;
        }
        result
    }

    /// Publish the will like any other message from this client
    async fn publish_will(&self, will: Will) {
        let hooks = &self.broker.hooks;
        let publish = will.to_publish();

        if !hooks
            .on_acl_check(&self.info, &publish.topic, Access::Write)
            .await
        {
            debug!(client_id = %self.info.id, topic = %publish.topic, "will not published, acl");
            return;
        }

        let Some(publish) = hooks.on_publish(&self.info, publish).await else {
            debug!(client_id = %self.info.id, "will rejected by hooks");
            return;
        };

        self.broker.route(&self.info, publish.clone()).await;
        hooks.on_will_sent(&self.info, &publish).await;
    }
}
