//! Per-connection writer task.
//!
//! Drains the connection's outbound queue, encodes packets into one buffer
//! and flushes once per batch instead of once per packet.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::codec::Encoder;
use crate::protocol::Packet;

/// Flush once this many bytes are buffered even if more packets are waiting
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Write packets from `rx` until every sender is gone, then shut the
/// stream down.
pub(crate) async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Packet>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoder = Encoder::new();
    let mut buf = BytesMut::with_capacity(4096);

    while let Some(packet) = rx.recv().await {
        buf.clear();
        encode_into(&encoder, &packet, &mut buf);

        while buf.len() < MAX_BATCH_BYTES {
            match rx.try_recv() {
                Ok(packet) => encode_into(&encoder, &packet, &mut buf),
                Err(_) => break,
            }
        }

        if buf.is_empty() {
            continue;
        }
        trace!(bytes = buf.len(), "flushing batch");
        writer.write_all(&buf).await?;
        writer.flush().await?;
    }

    writer.shutdown().await
}

fn encode_into(encoder: &Encoder, packet: &Packet, buf: &mut BytesMut) {
    let start = buf.len();
    if let Err(e) = encoder.encode(packet, buf) {
        buf.truncate(start);
        warn!(packet = packet.name(), error = %e, "failed to encode packet, skipped");
    }
}
