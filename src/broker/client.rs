//! Registry entry for a connected client

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::hooks::ClientInfo;
use crate::protocol::Packet;
use crate::session::Session;

/// Why a connection is being closed from outside its own task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kick {
    /// A newer connection presented the same client id
    TakenOver,
    /// The listener or the broker is shutting down
    ServerClosing,
}

/// Handle to a live connection, stored in the broker's client registry.
///
/// Routing writes into `outbound`; the connection's writer task drains it.
pub struct ClientHandle {
    pub info: ClientInfo,
    pub session: Arc<RwLock<Session>>,
    pub outbound: mpsc::Sender<Packet>,
    /// Distinguishes successive connections of the same client id
    pub connection_id: u64,
    kick: watch::Sender<Option<Kick>>,
    closed: watch::Receiver<bool>,
}

impl ClientHandle {
    pub(crate) fn new(
        info: ClientInfo,
        session: Arc<RwLock<Session>>,
        outbound: mpsc::Sender<Packet>,
        connection_id: u64,
        kick: watch::Sender<Option<Kick>>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            info,
            session,
            outbound,
            connection_id,
            kick,
            closed,
        }
    }

    /// Ask the connection task to stop
    pub fn kick(&self, reason: Kick) {
        self.kick.send_replace(Some(reason));
    }

    #[cfg(test)]
    pub(crate) fn kick_reason(&self) -> Option<Kick> {
        *self.kick.borrow()
    }

    /// Receiver that turns `true` once the connection finished its cleanup
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}
