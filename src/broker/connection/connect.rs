//! CONNECT handling: validation, authentication, takeover and session setup

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Connection, PacketReader, ReadError};
use crate::broker::{Broker, ClientHandle, Kick};
use crate::error::BrokerError;
use crate::hooks::ClientInfo;
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, DecodeError, Packet};
use crate::topic::validate_topic_name;

/// Read the CONNECT packet and bring the client online.
///
/// On success the CONNACK is queued, the client is registered and the
/// connection is returned with the CONNACK session-present flag.
#[allow(clippy::too_many_arguments)]
pub(super) async fn establish<R>(
    broker: &Arc<Broker>,
    listener: Arc<str>,
    remote_addr: String,
    reader: &mut PacketReader<R>,
    outbound: mpsc::Sender<Packet>,
    closed: watch::Receiver<bool>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(Connection, bool), BrokerError>
where
    R: AsyncRead + Unpin,
{
    let connect = read_connect(broker, reader, &outbound).await?;
    let connection_id = broker.next_connection_id();

    // An empty client id is only allowed with a clean session
    let client_id: Arc<str> = if connect.client_id.is_empty() {
        if !connect.clean_session {
            refuse(&outbound, ConnectReturnCode::IdentifierRejected).await;
            return Err(BrokerError::ProtocolViolation(
                "empty client id requires a clean session".into(),
            ));
        }
        Arc::from(assign_client_id(connection_id))
    } else {
        Arc::from(connect.client_id.as_str())
    };

    if let Some(will) = &connect.will {
        validate_topic_name(&will.topic)
            .map_err(|e| BrokerError::ProtocolViolation(format!("will topic: {}", e)))?;
    }

    let clean_session = broker
        .config
        .clean_session_default
        .unwrap_or(connect.clean_session);

    let info = ClientInfo {
        id: client_id.clone(),
        listener,
        remote_addr,
        username: connect.username.clone(),
        clean_session,
        protocol_version: connect.protocol_version,
    };

    broker.hooks.on_connect(&info, &connect).await;

    if !broker.hooks.on_connect_authenticate(&info, &connect).await {
        info!(client_id = %client_id, remote = %info.remote_addr, "authentication rejected");
        refuse(&outbound, ConnectReturnCode::NotAuthorized).await;
        return Err(BrokerError::AuthenticationRejected);
    }

    take_over(broker, &client_id).await;

    if clean_session {
        // Subscriptions of a previous persistent session do not carry over
        broker.topics.remove_client(&client_id);
    }
    let (session, session_present) = broker.sessions.create_or_resume(&client_id, clean_session);
    {
        let mut s = session.write();
        s.username = connect.username.clone();
        s.will = connect.will.clone();
    }

    outbound
        .send(Packet::ConnAck(ConnAck::accepted(session_present)))
        .await
        .map_err(|_| super::writer_closed())?;

    let (kick_tx, kick_rx) = watch::channel(None);
    let handle = ClientHandle::new(
        info.clone(),
        session.clone(),
        outbound.clone(),
        connection_id,
        kick_tx,
        closed,
    );
    if let Some(previous) = broker.clients.insert(client_id.clone(), handle) {
        // Another connection for this id registered while we were waiting
        previous.kick(Kick::TakenOver);
    }
    // Checked after registering: a listener closing concurrently either
    // sees this handle or is seen here.
    if broker.is_listener_closed(&info.listener) {
        if let Some(own) = broker.clients.get(&client_id) {
            if own.connection_id == connection_id {
                debug!(
                    client_id = %client_id,
                    listener = %info.listener,
                    "listener closed during handshake"
                );
                own.kick(Kick::ServerClosing);
            }
        }
    }

    let keep_alive = (connect.keep_alive > 0)
        .then(|| Duration::from_millis(connect.keep_alive as u64 * 1500));

    info!(
        client_id = %client_id,
        listener = %info.listener,
        remote = %info.remote_addr,
        protocol = ?info.protocol_version,
        clean_session,
        session_present,
        keep_alive = connect.keep_alive,
        "client connected"
    );

    let conn = Connection {
        broker: broker.clone(),
        info,
        session,
        outbound,
        connection_id,
        keep_alive,
        kick: kick_rx,
        shutdown,
    };
    Ok((conn, session_present))
}

/// Wait for the first packet, which must be CONNECT
async fn read_connect<R>(
    broker: &Broker,
    reader: &mut PacketReader<R>,
    outbound: &mpsc::Sender<Packet>,
) -> Result<Connect, BrokerError>
where
    R: AsyncRead + Unpin,
{
    let first = match timeout(broker.config.connect_timeout, reader.next()).await {
        Err(_) => return Err(BrokerError::ConnectTimeout),
        Ok(Err(ReadError::Decode(DecodeError::UnsupportedProtocolVersion(level)))) => {
            debug!(level, "refusing unsupported protocol level");
            refuse(outbound, ConnectReturnCode::UnacceptableProtocolVersion).await;
            return Err(BrokerError::ProtocolViolation(format!(
                "unsupported protocol level {}",
                level
            )));
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(None)) => {
            return Err(BrokerError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "closed before CONNECT",
            )))
        }
        Ok(Ok(Some(packet))) => packet,
    };

    match first {
        Packet::Connect(connect) => Ok(*connect),
        other => Err(BrokerError::ProtocolViolation(format!(
            "expected CONNECT, got {}",
            other.name()
        ))),
    }
}

/// Close an existing connection with the same client id and wait until
/// its disconnect processing is done.
async fn take_over(broker: &Broker, client_id: &str) {
    let existing = broker.clients.get(client_id).map(|handle| {
        handle.kick(Kick::TakenOver);
        handle.closed()
    });

    if let Some(mut closed) = existing {
        info!(client_id, "taking over existing connection");
        let wait = async {
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        };
        let finished = timeout(broker.config.connect_timeout, wait).await.is_ok();
        if !finished {
            warn!(client_id, "previous connection did not close in time");
        }
    }
}

async fn refuse(outbound: &mpsc::Sender<Packet>, code: ConnectReturnCode) {
    let _ = outbound.send(Packet::ConnAck(ConnAck::refused(code))).await;
}

fn assign_client_id(connection_id: u64) -> String {
    let hash = ahash::RandomState::new().hash_one((connection_id, SystemTime::now()));
    format!("relaymq-{:016x}", hash)
}
