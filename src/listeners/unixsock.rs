//! Unix domain socket listener

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UnixListener;
use tracing::{debug, warn};

use super::{spawn_establish, CloseFn, CloseSignal, EstablishFn, Listener};
use crate::error::BrokerError;

pub struct UnixSockListener {
    id: String,
    path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    signal: CloseSignal,
}

impl UnixSockListener {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            listener: Mutex::new(None),
            signal: CloseSignal::new(),
        }
    }

    fn remove_socket_file(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Listener for UnixSockListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> String {
        self.path.display().to_string()
    }

    fn protocol(&self) -> &str {
        "unix"
    }

    async fn init(&self) -> Result<(), BrokerError> {
        // A stale socket file from a previous run would make bind fail
        let bind = self
            .remove_socket_file()
            .and_then(|()| UnixListener::bind(&self.path));
        let listener = bind.map_err(|source| BrokerError::ListenerBindFailure {
            listener: self.id.clone(),
            source,
        })?;
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
                    Ok((stream, _)) => {
                        if self.signal.is_closed() {
                            break;
                        }
                        debug!(listener = %self.id, "accepted connection");
                        spawn_establish(&establish, id.clone(), Box::new(stream), self.address());
                    }
                    Err(e) => warn!(listener = %self.id, error = %e, "accept failed"),
                },
            }
        }
    }

    fn close(&self, close_clients: CloseFn) {
        if self.signal.close() {
            self.listener.lock().take();
            if let Err(e) = self.remove_socket_file() {
                debug!(listener = %self.id, error = %e, "failed to remove socket file");
            }
            close_clients(&self.id);
        }
    }
}
