use crate::codec::PacketCodec;
use crate::error::{MqttError, Result};
use crate::packet::Packet;
use crate::session::ClientState;
use crate::transport::BoxedReader;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::trace;

/// Decodes packets from the read half of a connection
pub struct NetworkReader {
    stream: BoxedReader,
    buffer: BytesMut,
    codec: PacketCodec,
    read_timeout: Duration,
    state: Arc<ClientState>,
}

impl NetworkReader {
    /// Creates a reader over `stream`, counting traffic in `state`
    #[must_use]
    pub fn new(
        stream: BoxedReader,
        codec: PacketCodec,
        read_timeout: Duration,
        state: Arc<ClientState>,
    ) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            codec,
            read_timeout,
            state,
        }
    }

    /// Reads the next packet
    ///
    /// Returns `Ok(None)` when `read_timeout` passes without a whole packet,
    /// so the caller can do periodic work. Partial bytes stay buffered for
    /// the next call.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` on end of stream, `Io` on read failure, and the
    /// codec's `MalformedPacket`/`IncomingPacketTooLarge`
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buffer)? {
                self.state.note_packet_received();
                trace!(packet_type = ?packet.packet_type(), "Received packet");
                return Ok(Some(packet));
            }

            match timeout(self.read_timeout, self.stream.read_buf(&mut self.buffer)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    return Err(MqttError::ConnectionLost(
                        "connection closed by server".to_string(),
                    ))
                }
                Ok(Ok(n)) => self.state.note_bytes_received(n),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Bytes received but not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl std::fmt::Debug for NetworkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkReader")
            .field("buffered", &self.buffer.len())
            .field("codec", &self.codec)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}
