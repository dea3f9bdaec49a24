//! Hooks Module
//!
//! Extension points for authentication, authorization, persistence and
//! event observation. A [`Hook`] declares the events it provides; the
//! [`Hooks`] pipeline calls only the hooks providing an event, in
//! registration order.
//!
//! Three kinds of events exist:
//! - gate events (`OnConnectAuthenticate`, `OnAclCheck`): the first hook to
//!   say no wins, and with no hook providing the event the answer is no
//! - modifying events (`OnSubscribe`, `OnPublish`): each hook gets the
//!   previous hook's output
//! - observational events: every hook is called, failures are only logged

pub mod auth;
pub mod debug;
pub mod storage;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::error::BrokerError;
use crate::protocol::{Connect, ProtocolVersion, Publish, QoS, RetainHandling, SubAckReturnCode};
use crate::retained::{RetainAction, RetainedMessage};
use crate::session::{SessionSnapshot, Subscription};

#[cfg(test)]
mod tests;

/// Events a hook can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    OnStarted,
    OnStopped,
    OnConnectAuthenticate,
    OnAclCheck,
    OnConnect,
    OnSessionEstablished,
    OnDisconnect,
    OnSubscribe,
    OnSubscribed,
    OnUnsubscribed,
    OnPublish,
    OnPublished,
    OnPublishDropped,
    OnRetainMessage,
    OnQosPublish,
    OnQosComplete,
    OnPacketIdExhausted,
    OnWillSent,
    OnSessionPersist,
    OnClientExpired,
    StoredSessions,
    StoredRetainedMessages,
}

impl HookEvent {
    pub const ALL: [HookEvent; 22] = [
        HookEvent::OnStarted,
        HookEvent::OnStopped,
        HookEvent::OnConnectAuthenticate,
        HookEvent::OnAclCheck,
        HookEvent::OnConnect,
        HookEvent::OnSessionEstablished,
        HookEvent::OnDisconnect,
        HookEvent::OnSubscribe,
        HookEvent::OnSubscribed,
        HookEvent::OnUnsubscribed,
        HookEvent::OnPublish,
        HookEvent::OnPublished,
        HookEvent::OnPublishDropped,
        HookEvent::OnRetainMessage,
        HookEvent::OnQosPublish,
        HookEvent::OnQosComplete,
        HookEvent::OnPacketIdExhausted,
        HookEvent::OnWillSent,
        HookEvent::OnSessionPersist,
        HookEvent::OnClientExpired,
        HookEvent::StoredSessions,
        HookEvent::StoredRetainedMessages,
    ];
}

/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Options passed to `init` are not of the hook's type or are invalid
    InvalidOptions(String),
    /// The message must not be routed (`on_publish`)
    Rejected,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::InvalidOptions(msg) => write!(f, "Invalid options: {}", msg),
            HookError::Rejected => write!(f, "Rejected"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Access requested in an ACL check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Subscribe to a filter
    Read,
    /// Publish to a topic
    Write,
}

/// Copy of the client data handed to hooks
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: Arc<str>,
    /// Id of the listener the client connected through
    pub listener: Arc<str>,
    pub remote_addr: String,
    pub username: Option<String>,
    pub clean_session: bool,
    pub protocol_version: ProtocolVersion,
}

impl ClientInfo {
    /// Client info used for messages the broker publishes itself
    pub fn internal() -> Self {
        Self {
            id: Arc::from("$broker"),
            listener: Arc::from("local"),
            remote_addr: String::new(),
            username: None,
            clean_session: true,
            protocol_version: ProtocolVersion::V311,
        }
    }
}

/// One filter of a SUBSCRIBE as seen by `on_subscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub filter: String,
    pub qos: QoS,
    pub retain_handling: RetainHandling,
    /// Set to refuse the filter (SUBACK failure)
    pub denied: bool,
}

impl SubscribeRequest {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
            retain_handling: RetainHandling::default(),
            denied: false,
        }
    }

    pub fn to_subscription(&self) -> Subscription {
        Subscription {
            filter: self.filter.clone(),
            qos: self.qos,
            retain_handling: self.retain_handling,
        }
    }
}

/// Broker hook
///
/// Only the methods of events returned by [`Hook::provides`] are called.
/// Gate methods default to denying.
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// Identifier used in log lines
    fn id(&self) -> &str;

    /// Whether this hook handles `event`
    fn provides(&self, event: HookEvent) -> bool;

    /// Configure the hook. Hooks without options reject any.
    fn init(&mut self, options: Option<&(dyn Any + Send + Sync)>) -> HookResult<()> {
        match options {
            None => Ok(()),
            Some(_) => Err(HookError::InvalidOptions(format!(
                "hook {} takes no options",
                self.id()
            ))),
        }
    }

    /// Called when the broker closes
    async fn stop(&self) -> HookResult<()> {
        Ok(())
    }

    /// Whether the client may connect
    async fn on_connect_authenticate(&self, _client: &ClientInfo, _connect: &Connect) -> bool {
        false
    }

    /// Whether the client may read from a filter or write to a topic
    async fn on_acl_check(&self, _client: &ClientInfo, _topic: &str, _access: Access) -> bool {
        false
    }

    /// Rewrite the filters of a SUBSCRIBE
    async fn on_subscribe(
        &self,
        _client: &ClientInfo,
        requests: Vec<SubscribeRequest>,
    ) -> HookResult<Vec<SubscribeRequest>> {
        Ok(requests)
    }

    /// Rewrite an inbound PUBLISH, or refuse it with [`HookError::Rejected`]
    async fn on_publish(&self, _client: &ClientInfo, publish: Publish) -> HookResult<Publish> {
        Ok(publish)
    }

    async fn on_started(&self) -> HookResult<()> {
        Ok(())
    }

    async fn on_stopped(&self) -> HookResult<()> {
        Ok(())
    }

    /// CONNECT received, before authentication
    async fn on_connect(&self, _client: &ClientInfo, _connect: &Connect) -> HookResult<()> {
        Ok(())
    }

    /// CONNACK accepted and the session is ready
    async fn on_session_established(
        &self,
        _client: &ClientInfo,
        _session_present: bool,
    ) -> HookResult<()> {
        Ok(())
    }

    /// The connection ended. `expire` is true when the session is discarded.
    async fn on_disconnect(
        &self,
        _client: &ClientInfo,
        _error: Option<&BrokerError>,
        _expire: bool,
    ) -> HookResult<()> {
        Ok(())
    }

    async fn on_subscribed(
        &self,
        _client: &ClientInfo,
        _requests: &[SubscribeRequest],
        _return_codes: &[SubAckReturnCode],
    ) -> HookResult<()> {
        Ok(())
    }

    async fn on_unsubscribed(&self, _client: &ClientInfo, _filters: &[String]) -> HookResult<()> {
        Ok(())
    }

    /// A PUBLISH was routed to its subscribers
    async fn on_published(&self, _client: &ClientInfo, _publish: &Publish) -> HookResult<()> {
        Ok(())
    }

    /// A message for `client_id` was discarded
    async fn on_publish_dropped(&self, _client_id: &str, _publish: &Publish) -> HookResult<()> {
        Ok(())
    }

    async fn on_retain_message(
        &self,
        _message: &RetainedMessage,
        _action: RetainAction,
    ) -> HookResult<()> {
        Ok(())
    }

    /// A QoS 1/2 PUBLISH was sent to `client_id`, `resends` times before
    async fn on_qos_publish(
        &self,
        _client_id: &str,
        _publish: &Publish,
        _resends: u32,
    ) -> HookResult<()> {
        Ok(())
    }

    /// An outbound QoS 1/2 exchange completed
    async fn on_qos_complete(&self, _client_id: &str, _packet_id: u16) -> HookResult<()> {
        Ok(())
    }

    /// No packet id was free; the message waits in the session queue
    async fn on_packet_id_exhausted(&self, _client_id: &str, _publish: &Publish) -> HookResult<()> {
        Ok(())
    }

    async fn on_will_sent(&self, _client: &ClientInfo, _will: &Publish) -> HookResult<()> {
        Ok(())
    }

    /// State of a persistent session after a change worth storing
    async fn on_session_persist(&self, _snapshot: &SessionSnapshot) -> HookResult<()> {
        Ok(())
    }

    /// A disconnected session expired or was discarded
    async fn on_client_expired(&self, _client_id: &str) -> HookResult<()> {
        Ok(())
    }

    /// Sessions to restore when the broker starts serving
    async fn stored_sessions(&self) -> HookResult<Vec<SessionSnapshot>> {
        Ok(Vec::new())
    }

    /// Retained messages to restore when the broker starts serving
    async fn stored_retained_messages(&self) -> HookResult<Vec<RetainedMessage>> {
        Ok(Vec::new())
    }
}

type Panic = Box<dyn Any + Send>;

/// Log a failed or panicked observational hook call
fn report(hook: &dyn Hook, event: HookEvent, result: Result<HookResult<()>, Panic>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let error = BrokerError::HookFailure(e.to_string());
            warn!(hook = hook.id(), ?event, %error, "hook failed");
        }
        Err(_) => {
            error!(hook = hook.id(), ?event, "hook panicked");
        }
    }
}

/// Call an observational method on every hook providing `$event`
macro_rules! emit {
    ($self:ident, $event:expr, |$hook:ident| $call:expr) => {{
        let event = $event;
        for $hook in $self.providing(event).iter() {
            let result = AssertUnwindSafe($call).catch_unwind().await;
            report($hook.as_ref(), event, result);
        }
    }};
}

/// Ordered hook pipeline
///
/// The hook list is copy-on-write, so no lock is held while a hook runs.
pub struct Hooks {
    hooks: RwLock<Arc<[Arc<dyn Hook>]>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Initialise `hook` with `options` and append it to the pipeline
    pub fn add_hook<H: Hook>(
        &self,
        mut hook: H,
        options: Option<&(dyn Any + Send + Sync)>,
    ) -> HookResult<()> {
        hook.init(options)?;

        let mut hooks = self.hooks.write();
        let mut list: Vec<Arc<dyn Hook>> = hooks.iter().cloned().collect();
        list.push(Arc::new(hook));
        *hooks = Arc::from(list);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Whether any hook provides `event`
    pub fn provides(&self, event: HookEvent) -> bool {
        self.hooks.read().iter().any(|h| h.provides(event))
    }

    fn providing(&self, event: HookEvent) -> Vec<Arc<dyn Hook>> {
        let hooks = self.hooks.read().clone();
        hooks.iter().filter(|h| h.provides(event)).cloned().collect()
    }

    /// Stop every hook
    pub async fn stop(&self) {
        let hooks = self.hooks.read().clone();
        for hook in hooks.iter() {
            match AssertUnwindSafe(hook.stop()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(hook = hook.id(), error = %e, "hook failed to stop"),
                Err(_) => error!(hook = hook.id(), "hook panicked while stopping"),
            }
        }
    }

    /// Whether the client may connect. Denies when no hook decides.
    pub async fn on_connect_authenticate(&self, client: &ClientInfo, connect: &Connect) -> bool {
        let hooks = self.providing(HookEvent::OnConnectAuthenticate);
        if hooks.is_empty() {
            return false;
        }
        for hook in &hooks {
            let allowed = AssertUnwindSafe(hook.on_connect_authenticate(client, connect))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(hook = hook.id(), "authentication hook panicked");
                    false
                });
            if !allowed {
                return false;
            }
        }
        true
    }

    /// Whether the client may access `topic`. Denies when no hook decides.
    pub async fn on_acl_check(&self, client: &ClientInfo, topic: &str, access: Access) -> bool {
        let hooks = self.providing(HookEvent::OnAclCheck);
        if hooks.is_empty() {
            return false;
        }
        for hook in &hooks {
            let allowed = AssertUnwindSafe(hook.on_acl_check(client, topic, access))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(hook = hook.id(), "acl hook panicked");
                    false
                });
            if !allowed {
                return false;
            }
        }
        true
    }

    /// Pass the filters of a SUBSCRIBE through every hook.
    ///
    /// A hook may lower the QoS or deny a filter. Raising the QoS above the
    /// request or changing the number of filters counts as a failure and
    /// the previous value is kept.
    pub async fn on_subscribe(
        &self,
        client: &ClientInfo,
        requests: Vec<SubscribeRequest>,
    ) -> Vec<SubscribeRequest> {
        let mut current = requests;
        for hook in self.providing(HookEvent::OnSubscribe).iter() {
            let result = AssertUnwindSafe(hook.on_subscribe(client, current.clone()))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(next)) if is_valid_rewrite(&current, &next) => current = next,
                Ok(Ok(_)) => {
                    let error = BrokerError::HookFailure("invalid subscription rewrite".into());
                    warn!(hook = hook.id(), %error, "hook failed");
                }
                other => report(
                    hook.as_ref(),
                    HookEvent::OnSubscribe,
                    other.map(|r| r.map(|_| ())),
                ),
            }
        }
        current
    }

    /// Pass an inbound PUBLISH through every hook.
    ///
    /// Returns `None` when a hook rejected the message. Failing hooks are
    /// skipped.
    pub async fn on_publish(&self, client: &ClientInfo, publish: Publish) -> Option<Publish> {
        let mut current = publish;
        for hook in self.providing(HookEvent::OnPublish).iter() {
            let result = AssertUnwindSafe(hook.on_publish(client, current.clone()))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(next)) => current = next,
                Ok(Err(HookError::Rejected)) => return None,
                other => report(
                    hook.as_ref(),
                    HookEvent::OnPublish,
                    other.map(|r| r.map(|_| ())),
                ),
            }
        }
        Some(current)
    }

    pub async fn on_started(&self) {
        emit!(self, HookEvent::OnStarted, |hook| hook.on_started());
    }

    pub async fn on_stopped(&self) {
        emit!(self, HookEvent::OnStopped, |hook| hook.on_stopped());
    }

    pub async fn on_connect(&self, client: &ClientInfo, connect: &Connect) {
        emit!(self, HookEvent::OnConnect, |hook| hook.on_connect(client, connect));
    }

    pub async fn on_session_established(&self, client: &ClientInfo, session_present: bool) {
        emit!(self, HookEvent::OnSessionEstablished, |hook| hook
            .on_session_established(client, session_present));
    }

    pub async fn on_disconnect(
        &self,
        client: &ClientInfo,
        error: Option<&BrokerError>,
        expire: bool,
    ) {
        emit!(self, HookEvent::OnDisconnect, |hook| hook
            .on_disconnect(client, error, expire));
    }

    pub async fn on_subscribed(
        &self,
        client: &ClientInfo,
        requests: &[SubscribeRequest],
        return_codes: &[SubAckReturnCode],
    ) {
        emit!(self, HookEvent::OnSubscribed, |hook| hook
            .on_subscribed(client, requests, return_codes));
    }

    pub async fn on_unsubscribed(&self, client: &ClientInfo, filters: &[String]) {
        emit!(self, HookEvent::OnUnsubscribed, |hook| hook
            .on_unsubscribed(client, filters));
    }

    pub async fn on_published(&self, client: &ClientInfo, publish: &Publish) {
        emit!(self, HookEvent::OnPublished, |hook| hook.on_published(client, publish));
    }

    pub async fn on_publish_dropped(&self, client_id: &str, publish: &Publish) {
        emit!(self, HookEvent::OnPublishDropped, |hook| hook
            .on_publish_dropped(client_id, publish));
    }

    pub async fn on_retain_message(&self, message: &RetainedMessage, action: RetainAction) {
        emit!(self, HookEvent::OnRetainMessage, |hook| hook
            .on_retain_message(message, action));
    }

    pub async fn on_qos_publish(&self, client_id: &str, publish: &Publish, resends: u32) {
        emit!(self, HookEvent::OnQosPublish, |hook| hook
            .on_qos_publish(client_id, publish, resends));
    }

    pub async fn on_qos_complete(&self, client_id: &str, packet_id: u16) {
        emit!(self, HookEvent::OnQosComplete, |hook| hook
            .on_qos_complete(client_id, packet_id));
    }

    pub async fn on_packet_id_exhausted(&self, client_id: &str, publish: &Publish) {
        emit!(self, HookEvent::OnPacketIdExhausted, |hook| hook
            .on_packet_id_exhausted(client_id, publish));
    }

    pub async fn on_will_sent(&self, client: &ClientInfo, will: &Publish) {
        emit!(self, HookEvent::OnWillSent, |hook| hook.on_will_sent(client, will));
    }

    pub async fn on_session_persist(&self, snapshot: &SessionSnapshot) {
        emit!(self, HookEvent::OnSessionPersist, |hook| hook
            .on_session_persist(snapshot));
    }

    pub async fn on_client_expired(&self, client_id: &str) {
        emit!(self, HookEvent::OnClientExpired, |hook| hook
            .on_client_expired(client_id));
    }

    /// Sessions from every storage hook, in hook order
    pub async fn stored_sessions(&self) -> Vec<SessionSnapshot> {
        let mut sessions = Vec::new();
        for hook in self.providing(HookEvent::StoredSessions).iter() {
            match AssertUnwindSafe(hook.stored_sessions()).catch_unwind().await {
                Ok(Ok(loaded)) => sessions.extend(loaded),
                other => report(
                    hook.as_ref(),
                    HookEvent::StoredSessions,
                    other.map(|r| r.map(|_| ())),
                ),
            }
        }
        sessions
    }

    /// Retained messages from every storage hook, in hook order
    pub async fn stored_retained_messages(&self) -> Vec<RetainedMessage> {
        let mut messages = Vec::new();
        for hook in self.providing(HookEvent::StoredRetainedMessages).iter() {
            match AssertUnwindSafe(hook.stored_retained_messages())
                .catch_unwind()
                .await
            {
                Ok(Ok(loaded)) => messages.extend(loaded),
                other => report(
                    hook.as_ref(),
                    HookEvent::StoredRetainedMessages,
                    other.map(|r| r.map(|_| ())),
                ),
            }
        }
        messages
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_rewrite(before: &[SubscribeRequest], after: &[SubscribeRequest]) -> bool {
    before.len() == after.len()
        && before
            .iter()
            .zip(after)
            .all(|(b, a)| a.filter == b.filter && a.qos <= b.qos)
}
