//! MQTT Broker Core
//!
//! The broker ties the topic index, the session store, the retained store
//! and the hook pipeline together. Listeners hand accepted streams to
//! [`Broker::establish`]; each stream then runs as its own connection task.
//! Two background tasks run while the broker serves: in-flight retries and
//! session expiry.

mod client;
mod connection;
mod router;
mod writer;

#[cfg(test)]
mod tests;

pub use client::{ClientHandle, Kick};

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::hooks::{ClientInfo, Hook, HookEvent, Hooks};
use crate::listeners::{BoxedStream, CloseFn, EstablishFn, Listener};
use crate::protocol::{Packet, Publish, QoS};
use crate::retained::RetainedStore;
use crate::session::{Session, SessionLimits, SessionStore};
use crate::topic::{validate_topic_name, TopicIndex};
use router::Delivery;

/// How long `close` waits for connections to finish their cleanup
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base delay before an unacknowledged QoS 1/2 packet is resent
    pub inflight_ttl: Duration,
    /// Upper bound of the exponential retry backoff
    pub max_retry_backoff: Duration,
    /// Outbound packet ids in use per session (0 = 65535)
    pub max_inflight: u16,
    /// Queued messages per session (0 = never queue)
    pub max_queued_messages: usize,
    /// Inbound QoS 2 exchanges awaiting PUBREL per session (0 = unbounded)
    pub max_awaiting_rel: usize,
    /// Highest QoS granted to subscriptions
    pub max_qos: QoS,
    /// Overrides the clean session flag of every CONNECT when set
    pub clean_session_default: Option<bool>,
    /// How long a disconnected persistent session is kept (None = forever)
    pub session_expiry: Option<Duration>,
    /// Store retained messages
    pub retain_available: bool,
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// How often in-flight tables are scanned for due retries
    pub retry_check_interval: Duration,
    /// How often disconnected sessions are checked for expiry
    pub expiry_check_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let limits = SessionLimits::default();
        Self {
            inflight_ttl: Duration::from_secs(20),
            max_retry_backoff: Duration::from_secs(300),
            max_inflight: limits.max_inflight,
            max_queued_messages: limits.max_queued,
            max_awaiting_rel: limits.max_awaiting_rel,
            max_qos: QoS::ExactlyOnce,
            clean_session_default: None,
            session_expiry: None,
            retain_available: true,
            outbound_capacity: 1024,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(10),
            retry_check_interval: Duration::from_secs(1),
            expiry_check_interval: Duration::from_secs(60),
        }
    }
}

impl BrokerConfig {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_inflight: self.max_inflight,
            max_queued: self.max_queued_messages,
            max_awaiting_rel: self.max_awaiting_rel,
        }
    }
}

/// The MQTT Broker
pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) sessions: SessionStore,
    pub(crate) topics: TopicIndex,
    pub(crate) retained: RetainedStore,
    /// Live connections by client id
    pub(crate) clients: DashMap<Arc<str>, ClientHandle>,
    pub(crate) hooks: Hooks,
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
    /// Listeners whose clients were told to go; late handshakes on them are refused
    closed_listeners: DashSet<Arc<str>>,
    shutdown: broadcast::Sender<()>,
    next_connection_id: AtomicU64,
    serving: AtomicBool,
    closed: AtomicBool,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            sessions: SessionStore::new(config.session_limits()),
            topics: TopicIndex::new(),
            retained: RetainedStore::new(),
            clients: DashMap::new(),
            hooks: Hooks::new(),
            listeners: RwLock::new(Vec::new()),
            closed_listeners: DashSet::new(),
            shutdown,
            next_connection_id: AtomicU64::new(1),
            serving: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Initialise `hook` with `options` and append it to the pipeline
    pub fn add_hook<H: Hook>(
        &self,
        hook: H,
        options: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), BrokerError> {
        self.hooks
            .add_hook(hook, options)
            .map_err(|e| BrokerError::HookFailure(e.to_string()))
    }

    /// Initialise and register a listener. If the broker is already serving,
    /// the listener starts accepting immediately.
    pub async fn add_listener(
        self: &Arc<Self>,
        listener: Arc<dyn Listener>,
    ) -> Result<(), BrokerError> {
        if self.listeners.read().iter().any(|l| l.id() == listener.id()) {
            return Err(BrokerError::DuplicateListener(listener.id().to_string()));
        }

        listener.init().await?;

        {
            let mut listeners = self.listeners.write();
            if listeners.iter().any(|l| l.id() == listener.id()) {
                return Err(BrokerError::DuplicateListener(listener.id().to_string()));
            }
            listeners.push(listener.clone());
        }

        if self.serving.load(Ordering::Acquire) {
            self.spawn_listener(listener);
        }
        Ok(())
    }

    /// Ids of the registered listeners
    pub fn listener_ids(&self) -> Vec<String> {
        self.listeners.read().iter().map(|l| l.id().to_string()).collect()
    }

    /// Restore stored state, start the background tasks and every listener
    pub async fn serve(self: &Arc<Self>) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ServerClosing);
        }
        if self.serving.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.restore_from_hooks().await;
        self.spawn_retry_task();
        self.spawn_expiry_task();

        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            self.spawn_listener(listener);
        }

        self.hooks.on_started().await;
        info!("broker started");
        Ok(())
    }

    /// Stop accepting, close every connection and stop the hooks
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("broker closing");

        let _ = self.shutdown.send(());

        let listeners: Vec<_> = self.listeners.read().clone();
        let close_clients = self.close_clients_fn();
        for listener in listeners {
            listener.close(close_clients.clone());
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.clients.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.clients.is_empty() {
            warn!(remaining = self.clients.len(), "connections still open after drain timeout");
        }

        self.persist_sessions().await;
        self.hooks.on_stopped().await;
        self.hooks.stop().await;
        info!("broker stopped");
    }

    /// Close one listener and the clients it accepted
    pub fn close_listener(self: &Arc<Self>, listener_id: &str) -> bool {
        let listener = self
            .listeners
            .read()
            .iter()
            .find(|l| l.id() == listener_id)
            .cloned();
        match listener {
            Some(listener) => {
                listener.close(self.close_clients_fn());
                true
            }
            None => false,
        }
    }

    /// Kick every client that connected through `listener_id`.
    ///
    /// The listener counts as closed from here on: a connection still in its
    /// CONNECT handshake is kicked as soon as it registers.
    pub fn close_clients(&self, listener_id: &str) {
        self.closed_listeners.insert(Arc::from(listener_id));
        for handle in self.clients.iter() {
            if handle.info.listener.as_ref() == listener_id {
                handle.kick(Kick::ServerClosing);
            }
        }
    }

    /// Run the MQTT session of one accepted stream to completion.
    ///
    /// Returns `Ok` when the client disconnected gracefully.
    pub async fn establish<S>(
        self: &Arc<Self>,
        listener_id: &str,
        stream: S,
        remote_addr: impl Into<String>,
    ) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.closed.load(Ordering::Acquire) || self.is_listener_closed(listener_id) {
            return Err(BrokerError::ServerClosing);
        }
        connection::run(
            self.clone(),
            Arc::from(listener_id),
            stream,
            remote_addr.into(),
        )
        .await
    }

    /// Callback handed to listeners for accepted streams
    pub fn establish_fn(self: &Arc<Self>) -> EstablishFn {
        let broker = self.clone();
        Arc::new(
            move |listener_id: Arc<str>,
                  stream: BoxedStream,
                  remote_addr: String|
                  -> BoxFuture<'static, Result<(), BrokerError>> {
                let broker = broker.clone();
                Box::pin(async move { broker.establish(&listener_id, stream, remote_addr).await })
            },
        )
    }

    pub(crate) fn is_listener_closed(&self, listener_id: &str) -> bool {
        self.closed_listeners.contains(listener_id)
    }

    fn close_clients_fn(self: &Arc<Self>) -> CloseFn {
        let broker = self.clone();
        Arc::new(move |listener_id: &str| broker.close_clients(listener_id))
    }

    /// Publish a message from inside the process.
    ///
    /// The message goes through the `OnPublish` hooks like any client
    /// publish, but no ACL check applies.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        validate_topic_name(topic).map_err(|e| BrokerError::ProtocolViolation(e.to_string()))?;

        let client = ClientInfo::internal();
        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retain;

        match self.hooks.on_publish(&client, publish).await {
            Some(publish) => self.route(&client, publish).await,
            None => debug!(topic, "internal publish rejected by hooks"),
        }
        Ok(())
    }

    /// Number of (client, filter) subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.topics.subscription_count()
    }

    /// Stored sessions, connected or not
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live connections
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    fn spawn_listener(self: &Arc<Self>, listener: Arc<dyn Listener>) {
        let establish = self.establish_fn();
        tokio::spawn(async move {
            info!(
                listener = listener.id(),
                address = %listener.address(),
                protocol = listener.protocol(),
                "listener serving"
            );
            listener.serve(establish).await;
            debug!(listener = listener.id(), "listener stopped");
        });
    }

    fn spawn_retry_task(self: &Arc<Self>) {
        let broker = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.retry_check_interval);
            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.recv() => {
                        if !matches!(result, Err(broadcast::error::RecvError::Lagged(_))) {
                            break;
                        }
                    }
                    _ = ticker.tick() => broker.retry_inflight().await,
                }
            }
        });
    }

    fn spawn_expiry_task(self: &Arc<Self>) {
        let broker = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.expiry_check_interval);
            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.recv() => {
                        if !matches!(result, Err(broadcast::error::RecvError::Lagged(_))) {
                            break;
                        }
                    }
                    _ = ticker.tick() => broker.expire_sessions().await,
                }
            }
        });
    }

    /// Resend due QoS 1/2 packets of every connected client, send the
    /// entries that found the outbound queue full earlier, then release
    /// messages that queued behind them.
    ///
    /// Stops at the first packet the outbound queue refuses; nothing after
    /// it is touched, so the next run picks up in the same order.
    pub(crate) async fn retry_inflight(&self) {
        let now = Instant::now();
        let targets: Vec<(Arc<str>, Arc<RwLock<Session>>, mpsc::Sender<Packet>)> = self
            .clients
            .iter()
            .map(|h| (h.key().clone(), h.session.clone(), h.outbound.clone()))
            .collect();

        for (client_id, session, outbound) in targets {
            let mut sent = Vec::new();
            let mut events = Vec::new();
            {
                let mut s = session.write();
                let due = s.outbound.due(
                    now,
                    self.config.inflight_ttl,
                    self.config.max_retry_backoff,
                );
                let mut blocked = false;
                for (packet_id, resend) in due {
                    if outbound.try_send(resend.into_packet()).is_err() {
                        blocked = true;
                        break;
                    }
                    s.outbound.mark_sent(packet_id, now);
                    if let Some(entry) = s.outbound.get(packet_id) {
                        sent.push((entry.publish.clone(), entry.retry_count));
                    }
                }

                while !blocked {
                    let Some(publish) = s.release_next() else {
                        break;
                    };
                    match outbound.try_send(Packet::Publish(publish.clone())) {
                        Ok(()) => {
                            if let Some(packet_id) = publish.packet_id {
                                s.outbound.mark_sent(packet_id, now);
                                events.push(Delivery::Sent(publish));
                            }
                        }
                        // Released QoS 1/2 messages stay `PendingSend` for the next run
                        Err(_) => {
                            if publish.qos == QoS::AtMostOnce {
                                events.push(Delivery::Dropped(publish));
                            }
                            blocked = true;
                        }
                    }
                }
            }

            for (publish, resends) in sent {
                if resends > 0 {
                    debug!(
                        client_id = %client_id,
                        packet_id = ?publish.packet_id,
                        resends,
                        "resent in-flight message"
                    );
                }
                self.hooks.on_qos_publish(&client_id, &publish, resends).await;
            }
            self.emit_deliveries(&client_id, events).await;
        }
    }

    /// Drop disconnected sessions past their expiry
    pub(crate) async fn expire_sessions(&self) {
        let expired = self
            .sessions
            .remove_expired(Instant::now(), self.config.session_expiry);
        for client_id in expired {
            let removed = self.topics.remove_client(&client_id);
            info!(client_id = %client_id, subscriptions = removed, "session expired");
            self.hooks.on_client_expired(&client_id).await;
        }
    }

    async fn restore_from_hooks(&self) {
        let now = Instant::now();
        let limits = self.config.session_limits();

        let mut sessions = 0usize;
        for snapshot in self.hooks.stored_sessions().await {
            let session = Session::restore(snapshot, limits, now);
            let client_id = session.client_id.clone();
            let subscriptions: Vec<_> = session.subscriptions.values().cloned().collect();
            if self.sessions.restore(session) {
                for subscription in subscriptions {
                    self.topics
                        .subscribe(&client_id, &subscription.filter, subscription.qos);
                }
                sessions += 1;
            }
        }

        let mut retained = 0usize;
        for message in self.hooks.stored_retained_messages().await {
            if !message.payload.is_empty() {
                self.retained.set(message);
                retained += 1;
            }
        }

        if sessions > 0 || retained > 0 {
            info!(sessions, retained, "restored state from storage");
        }
    }

    async fn persist_sessions(&self) {
        if !self.hooks.provides(HookEvent::OnSessionPersist) {
            return;
        }
        for session in self.sessions.all() {
            let snapshot = {
                let s = session.read();
                (!s.clean_session).then(|| s.snapshot())
            };
            if let Some(snapshot) = snapshot {
                self.hooks.on_session_persist(&snapshot).await;
            }
        }
    }
}
