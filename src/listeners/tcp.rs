//! Plain TCP listener

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{spawn_establish, CloseFn, CloseSignal, EstablishFn, Listener};
use crate::error::BrokerError;

pub struct TcpListener {
    id: String,
    address: String,
    listener: Mutex<Option<tokio::net::TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    signal: CloseSignal,
}

impl TcpListener {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            signal: CloseSignal::new(),
        }
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

/// Bind a TCP socket, mapping failures to `ListenerBindFailure`
pub(crate) async fn bind(id: &str, address: &str) -> Result<tokio::net::TcpListener, BrokerError> {
    tokio::net::TcpListener::bind(address)
        .await
        .map_err(|source| BrokerError::ListenerBindFailure {
            listener: id.to_string(),
            source,
        })
}

#[async_trait]
impl Listener for TcpListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.address.clone(),
        }
    }

    fn protocol(&self) -> &str {
        "tcp"
    }

    async fn init(&self) -> Result<(), BrokerError> {
        let listener = bind(&self.id, &self.address).await?;
        *self.local_addr.lock() = listener.local_addr().ok();
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn serve(&self, establish: EstablishFn) {
        let Some(listener) = self.listener.lock().take() else {
            warn!(listener = %self.id, "serve called without a bound socket");
            return;
        };
        let id: Arc<str> = Arc::from(self.id.as_str());

        loop {
            tokio::select! {
                biased;

                _ = self.signal.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if self.signal.is_closed() {
                            break;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "failed to set TCP_NODELAY");
                        }
                        debug!(listener = %self.id, remote = %addr, "accepted connection");
                        spawn_establish(&establish, id.clone(), Box::new(stream), addr.to_string());
                    }
                    Err(e) => warn!(listener = %self.id, error = %e, "accept failed"),
                },
            }
        }
    }

    fn close(&self, close_clients: CloseFn) {
        if self.signal.close() {
            self.listener.lock().take();
            close_clients(&self.id);
        }
    }
}
