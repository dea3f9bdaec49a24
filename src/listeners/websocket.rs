//! MQTT over WebSocket
//!
//! [`WsStream`] wraps a tokio-tungstenite WebSocket and presents it as a
//! byte stream: incoming binary frames are concatenated, every write goes
//! out as one binary frame.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use super::tcp::bind;
use super::{log_establish_error, CloseFn, CloseSignal, EstablishFn, Listener};
use crate::error::BrokerError;

/// Subprotocols accepted during the handshake
const MQTT_SUBPROTOCOLS: [&str; 2] = ["mqtt", "mqttv3.1"];

pub struct WsStream {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    stream: SplitStream<WebSocketStream<TcpStream>>,
    /// Bytes of the last frame not yet handed to the reader
    read_buffer: BytesMut,
    closed: bool,
}

impl WsStream {
    pub fn new(ws: WebSocketStream<TcpStream>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(2048),
            closed: false,
        }
    }

    /// Run the server handshake, requiring `expected_path` and echoing the
    /// first MQTT subprotocol the client offers.
    pub async fn accept_with_path(stream: TcpStream, expected_path: &str) -> io::Result<Self> {
        let expected_path = expected_path.to_string();

        let callback = move |req: &Request, mut response: Response| {
            let request_path = req.uri().path();
            if request_path != expected_path {
                return Err(ErrorResponse::new(Some(format!(
                    "invalid path: expected '{}', got '{}'",
                    expected_path, request_path
                ))));
            }

            let offered = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if let Some(protocol) = offered
                .split(',')
                .map(str::trim)
                .find(|p| MQTT_SUBPROTOCOLS.contains(p))
            {
                response.headers_mut().insert(
                    "sec-websocket-protocol",
                    HeaderValue::from_static(static_protocol(protocol)),
                );
            }
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(io::Error::other)?;
        Ok(Self::new(ws))
    }

    fn fill(&mut self, buf: &mut ReadBuf<'_>, data: &[u8]) {
        let n = buf.remaining().min(data.len());
        buf.put_slice(&data[..n]);
        if n < data.len() {
            self.read_buffer.extend_from_slice(&data[n..]);
        }
    }
}

fn static_protocol(protocol: &str) -> &'static str {
    MQTT_SUBPROTOCOLS
        .iter()
        .find(|p| **p == protocol)
        .copied()
        .unwrap_or(MQTT_SUBPROTOCOLS[0])
}

impl AsyncRead for WsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            let n = buf.remaining().min(self.read_buffer.len());
            buf.put_slice(&self.read_buffer[..n]);
            self.read_buffer.advance(n);
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.fill(buf, &data);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
                // Control and text frames carry no MQTT data
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let frame = Message::Binary(buf.to_vec());
                match Pin::new(&mut self.sink).start_send(frame) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink).poll_flush(cx).map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink).poll_close(cx).map_err(io::Error::other)
    }
}

/// WebSocket listener; the handshake runs on the connection's own task
pub struct WebSocketListener {
    id: String,
    address: String,
    path: String,
    listener: Mutex<Option<tokio::net::TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    signal: CloseSignal,
}

impl WebSocketListener {
    pub fn new(id: impl Into<String>, address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            path: path.into(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            signal: CloseSignal::new(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl Listener for WebSocketListener {
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
        "ws"
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
                        let _ = stream.set_nodelay(true);
                        let establish = establish.clone();
                        let id = id.clone();
                        let path = self.path.clone();
                        tokio::spawn(async move {
                            match WsStream::accept_with_path(stream, &path).await {
                                Ok(ws) => {
                                    let remote = addr.to_string();
                                    if let Err(e) = establish(id.clone(), Box::new(ws), remote).await {
                                        log_establish_error(&id, &e);
                                    }
                                }
                                Err(e) => debug!(
                                    listener = %id,
                                    remote = %addr,
                                    error = %e,
                                    "websocket handshake failed"
                                ),
                            }
                        });
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_protocol() {
        assert_eq!(static_protocol("mqtt"), "mqtt");
        assert_eq!(static_protocol("mqttv3.1"), "mqttv3.1");
    }
}
