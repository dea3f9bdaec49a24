//! Network listeners
//!
//! A listener owns one bound endpoint. The broker initialises it when it is
//! added, runs `serve` on its own task once the broker serves, and calls
//! `close` once on shutdown. Every accepted stream is handed to the
//! broker's establish callback on a task of its own.

mod tcp;
mod tls;
#[cfg(unix)]
mod unixsock;
mod websocket;

pub use tcp::TcpListener;
pub use tls::{load_tls_config, TlsError, TlsListener};
#[cfg(unix)]
pub use unixsock::UnixSockListener;
pub use websocket::{WebSocketListener, WsStream};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{ListenerConfig, ListenerProtocol};
use crate::error::BrokerError;

/// Byte stream accepted by a listener
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn Stream>;

/// Connection task of one accepted stream
pub type EstablishFuture = BoxFuture<'static, Result<(), BrokerError>>;

/// Called for each accepted stream with the listener id and remote address
pub type EstablishFn = Arc<dyn Fn(Arc<str>, BoxedStream, String) -> EstablishFuture + Send + Sync>;

/// Called once by `close` with the listener id, to disconnect its clients
pub type CloseFn = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait Listener: Send + Sync {
    fn id(&self) -> &str;

    /// Bound address once initialised, the configured one before
    fn address(&self) -> String;

    fn protocol(&self) -> &str;

    /// Bind the endpoint
    async fn init(&self) -> Result<(), BrokerError>;

    /// Accept until closed
    async fn serve(&self, establish: EstablishFn);

    /// Stop accepting and close the clients of this listener. Only the
    /// first call has an effect.
    fn close(&self, close_clients: CloseFn);
}

/// One-shot close flag shared by a listener and its accept loop
#[derive(Debug)]
pub(crate) struct CloseSignal {
    ended: AtomicBool,
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            ended: AtomicBool::new(false),
            tx,
        }
    }

    /// Returns `true` for the call that actually closed
    pub(crate) fn close(&self) -> bool {
        if self
            .ended
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Resolves once `close` was called
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Run `establish` for an accepted stream on its own task
pub(crate) fn spawn_establish(
    establish: &EstablishFn,
    listener_id: Arc<str>,
    stream: BoxedStream,
    remote_addr: String,
) {
    let connection = establish(listener_id.clone(), stream, remote_addr);
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log_establish_error(&listener_id, &e);
        }
    });
}

pub(crate) fn log_establish_error(listener_id: &str, error: &BrokerError) {
    match error {
        BrokerError::Transport(_)
        | BrokerError::KeepAliveTimeout
        | BrokerError::ConnectTimeout
        | BrokerError::SessionTakenOver
        | BrokerError::ServerClosing => {
            debug!(listener = listener_id, error = %error, "connection ended")
        }
        _ => warn!(listener = listener_id, error = %error, "connection ended with error"),
    }
}

/// Build a listener from its configuration
pub fn from_config(config: &ListenerConfig) -> Result<Arc<dyn Listener>, BrokerError> {
    let listener: Arc<dyn Listener> = match config.protocol {
        ListenerProtocol::Tcp => Arc::new(TcpListener::new(&config.id, &config.address)),
        ListenerProtocol::Websocket => Arc::new(WebSocketListener::new(
            &config.id,
            &config.address,
            &config.ws_path,
        )),
        ListenerProtocol::Tls => {
            let tls = config.tls.as_ref().ok_or_else(|| {
                BrokerError::Config(format!("listener {}: tls section required", config.id))
            })?;
            let acceptor = load_tls_config(tls)
                .map_err(|e| BrokerError::Config(format!("listener {}: {}", config.id, e)))?;
            Arc::new(TlsListener::new(&config.id, &config.address, acceptor))
        }
        #[cfg(unix)]
        ListenerProtocol::Unix => Arc::new(UnixSockListener::new(&config.id, &config.address)),
        #[cfg(not(unix))]
        ListenerProtocol::Unix => {
            return Err(BrokerError::Config(format!(
                "listener {}: unix sockets are not supported on this platform",
                config.id
            )))
        }
    };
    Ok(listener)
}
