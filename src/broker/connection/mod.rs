//! MQTT Connection Handler
//!
//! One task per accepted stream. The stream is split: a writer task drains
//! the connection's outbound queue (see `writer.rs`) while this task reads
//! and handles packets. Routing from other connections only ever touches
//! the outbound queue, never the socket.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::writer::write_loop;
use super::{Broker, Kick};
use crate::codec::Decoder;
use crate::error::BrokerError;
use crate::hooks::{ClientInfo, HookEvent};
use crate::protocol::{DecodeError, Packet};
use crate::session::Session;

/// How long a finished connection waits for its writer to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure while reading the next packet
#[derive(Debug)]
pub(crate) enum ReadError {
    Decode(DecodeError),
    Io(io::Error),
}

impl From<ReadError> for BrokerError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Decode(e) => e.into(),
            ReadError::Io(e) => e.into(),
        }
    }
}

/// Buffered packet reader over the read half of a stream
pub(crate) struct PacketReader<R> {
    reader: R,
    buf: BytesMut,
    decoder: Decoder,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(reader: R, max_packet_size: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
        }
    }

    /// Next complete packet, or `None` once the peer closed the stream.
    ///
    /// Cancel safe: bytes already read stay buffered.
    pub(crate) async fn next(&mut self) -> Result<Option<Packet>, ReadError> {
        loop {
            let decoded = self.decoder.decode(&self.buf).map_err(ReadError::Decode)?;
            if let Some((packet, consumed)) = decoded {
                self.buf.advance(consumed);
                trace!(packet = packet.name(), "packet received");
                return Ok(Some(packet));
            }

            let read = self.reader.read_buf(&mut self.buf).await.map_err(ReadError::Io)?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ReadError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-packet",
                )));
            }
        }
    }
}

/// Whether the read loop keeps going after a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnect,
}

/// An established MQTT connection
pub(crate) struct Connection {
    pub(crate) broker: Arc<Broker>,
    pub(crate) info: ClientInfo,
    pub(crate) session: Arc<RwLock<Session>>,
    pub(crate) outbound: mpsc::Sender<Packet>,
    pub(crate) connection_id: u64,
    /// 1.5 times the negotiated keep-alive, `None` when disabled
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) kick: watch::Receiver<Option<Kick>>,
    pub(crate) shutdown: broadcast::Receiver<()>,
}

/// Drive one accepted stream from CONNECT to close
pub(crate) async fn run<S>(
    broker: Arc<Broker>,
    listener: Arc<str>,
    stream: S,
    remote_addr: String,
) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = broker.subscribe_shutdown();
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound, rx) = mpsc::channel(broker.config.outbound_capacity.max(1));
    let writer = tokio::spawn(async move {
        if let Err(e) = write_loop(write_half, rx).await {
            debug!(error = %e, "writer stopped");
        }
    });

    let mut reader = PacketReader::new(read_half, broker.config.max_packet_size);
    let (closed_tx, closed_rx) = watch::channel(false);

    let established = connect::establish(
        &broker,
        listener,
        remote_addr,
        &mut reader,
        outbound.clone(),
        closed_rx,
        shutdown,
    )
    .await;

    let result = match established {
        Ok((mut conn, session_present)) => {
            let result = match conn.start(session_present).await {
                Ok(()) => conn.read_loop(&mut reader).await,
                Err(e) => Err(e),
            };
            conn.finish(result).await
        }
        Err(e) => Err(e),
    };

    closed_tx.send_replace(true);
    drop(outbound);
    if timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("writer did not drain in time");
    }
    result
}

impl Connection {
    async fn read_loop<R>(&mut self, reader: &mut PacketReader<R>) -> Result<(), BrokerError>
    where
        R: AsyncRead + Unpin,
    {
        let keep_alive = self.keep_alive;
        loop {
            let read = tokio::select! {
                biased;

                _ = self.kick.changed() => {
                    return Err(match *self.kick.borrow() {
                        Some(Kick::ServerClosing) => BrokerError::ServerClosing,
                        _ => BrokerError::SessionTakenOver,
                    });
                }
                _ = self.shutdown.recv() => return Err(BrokerError::ServerClosing),
                read = read_with_deadline(reader, keep_alive) => read,
            };

            let packet = match read? {
                Some(packet) => packet,
                None => {
                    return Err(BrokerError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
            };

            if self.handle_packet(packet).await? == Flow::Disconnect {
                return Ok(());
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow, BrokerError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await?,
            Packet::PubAck(ack) => self.handle_puback(ack.packet_id).await?,
            Packet::PubRec(rec) => self.handle_pubrec(rec.packet_id).await?,
            Packet::PubRel(rel) => self.handle_pubrel(rel.packet_id).await?,
            Packet::PubComp(comp) => self.handle_pubcomp(comp.packet_id).await?,
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await?,
            Packet::PingReq => self.send(Packet::PingResp).await?,
            Packet::Disconnect => return Ok(Flow::Disconnect),
            Packet::Connect(_) => {
                return Err(BrokerError::ProtocolViolation("second CONNECT".into()));
            }
            other => {
                return Err(BrokerError::ProtocolViolation(format!(
                    "{} is not accepted from clients",
                    other.name()
                )));
            }
        }
        Ok(Flow::Continue)
    }

    /// Queue a packet for this connection, waiting if the queue is full
    pub(crate) async fn send(&self, packet: Packet) -> Result<(), BrokerError> {
        self.outbound.send(packet).await.map_err(|_| writer_closed())
    }

    /// Hand a snapshot of a persistent session to the storage hooks
    pub(crate) async fn persist_session(&self) {
        if !self.broker.hooks.provides(HookEvent::OnSessionPersist) {
            return;
        }
        let snapshot = {
            let s = self.session.read();
            (!s.clean_session).then(|| s.snapshot())
        };
        if let Some(snapshot) = snapshot {
            self.broker.hooks.on_session_persist(&snapshot).await;
        }
    }
}

async fn read_with_deadline<R>(
    reader: &mut PacketReader<R>,
    keep_alive: Option<Duration>,
) -> Result<Option<Packet>, BrokerError>
where
    R: AsyncRead + Unpin,
{
    match keep_alive {
        Some(limit) => match timeout(limit, reader.next()).await {
            Ok(read) => read.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::KeepAliveTimeout),
        },
        None => reader.next().await.map_err(BrokerError::from),
    }
}

fn writer_closed() -> BrokerError {
    BrokerError::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "outbound queue closed"))
}
