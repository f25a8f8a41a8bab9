use crate::codec::PacketCodec;
use crate::error::Result;
use crate::packet::Packet;
use crate::session::ClientState;
use crate::transport::BoxedWriter;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::trace;

/// Encodes packets onto the write half of a connection
///
/// Packets go out in `chunk_size` pieces and every piece is counted as
/// outbound traffic for keep-alive purposes.
pub struct NetworkWriter {
    stream: BoxedWriter,
    buffer: BytesMut,
    codec: PacketCodec,
    chunk_size: usize,
    state: Arc<ClientState>,
}

impl NetworkWriter {
    /// Creates a writer over `stream`, counting traffic in `state`
    #[must_use]
    pub fn new(
        stream: BoxedWriter,
        codec: PacketCodec,
        chunk_size: usize,
        state: Arc<ClientState>,
    ) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(chunk_size),
            codec,
            chunk_size: chunk_size.max(1),
            state,
        }
    }

    /// Writes one packet and flushes it
    ///
    /// The size check against the server's maximum happens before any byte
    /// is written, so a rejected packet leaves the stream usable.
    ///
    /// # Errors
    ///
    /// `PacketTooLarge` for an oversized packet, `Io`/`ConnectionLost` if
    /// the write fails
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<usize> {
        self.codec.max_outgoing = self.state.limits().max_outgoing;
        self.buffer.clear();
        let len = self.codec.encode(packet, &mut self.buffer)?;

        for chunk in self.buffer.chunks(self.chunk_size) {
            self.stream.write_all(chunk).await?;
            self.state.note_bytes_sent(chunk.len());
        }
        self.stream.flush().await?;

        self.state.note_packet_sent();
        trace!(packet_type = ?packet.packet_type(), size = len, "Sent packet");
        Ok(len)
    }

    /// Shuts the write half down, ignoring errors from an already dead peer
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for NetworkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkWriter")
            .field("codec", &self.codec)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_packet;
    use crate::error::MqttError;
    use crate::packet::{ConnAckPacket, PublishPacket};
    use crate::protocol::v5::reason_codes::ReasonCode;
    use crate::{ProtocolVersion, QoS};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_chunked_write_counts_bytes() {
        let (client, mut server) = tokio::io::duplex(4096);
        let state = Arc::new(ClientState::new("writer"));
        let mut writer = NetworkWriter::new(
            Box::new(client),
            PacketCodec::new(ProtocolVersion::V5),
            16,
            state.clone(),
        );

        let publish = PublishPacket::new("a/b", vec![7u8; 100], QoS::AtMostOnce);
        let packet = Packet::Publish(publish);
        let len = writer.write_packet(&packet).await.unwrap();
        assert_eq!(state.stats().bytes_sent, len as u64);
        assert_eq!(state.stats().messages_sent, 1);

        let mut received = vec![0u8; len];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(decode_packet(&received, ProtocolVersion::V5).unwrap(), packet);
    }

    #[tokio::test]
    async fn test_server_maximum_rejects_before_writing() {
        let (client, _server) = tokio::io::duplex(4096);
        let state = Arc::new(ClientState::new("writer"));
        state.apply_connack(
            &ConnAckPacket::new(false, ReasonCode::Success).with_maximum_packet_size(32),
        );
        let mut writer = NetworkWriter::new(
            Box::new(client),
            PacketCodec::new(ProtocolVersion::V5),
            1024,
            state.clone(),
        );

        let publish = PublishPacket::new("a/b", vec![0u8; 64], QoS::AtMostOnce);
        assert!(matches!(
            writer.write_packet(&Packet::Publish(publish)).await,
            Err(MqttError::PacketTooLarge { max: 32, .. })
        ));
        assert_eq!(state.stats().bytes_sent, 0);

        assert!(writer.write_packet(&Packet::PingReq).await.is_ok());
    }
}
