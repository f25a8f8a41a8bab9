//! Resumable framing of MQTT packets over a byte buffer
//!
//! The codec never blocks and never fails on a short buffer: `decode`
//! returns `Ok(None)` until a whole packet is present, so the network reader
//! can keep appending bytes and retry.

use crate::encoding::try_decode_variable_int;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttTypeAndFlags, Packet};
use crate::ProtocolVersion;
use bebytes::BeBytes;
use bytes::{Buf, BytesMut};
use tracing::trace;

/// Version-aware packet encoder/decoder with size limits
///
/// `max_incoming` is the limit this client advertised, `max_outgoing` the one
/// the server advertised. `None` means the protocol maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    pub version: ProtocolVersion,
    pub max_incoming: Option<u32>,
    pub max_outgoing: Option<u32>,
}

impl PacketCodec {
    /// Creates a codec for `version` with no size limits
    #[must_use]
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            max_incoming: None,
            max_outgoing: None,
        }
    }

    /// Sets the maximum size of a decoded packet
    #[must_use]
    pub fn with_max_incoming(mut self, max: Option<u32>) -> Self {
        self.max_incoming = max;
        self
    }

    /// Sets the maximum size of an encoded packet
    #[must_use]
    pub fn with_max_outgoing(mut self, max: Option<u32>) -> Self {
        self.max_outgoing = max;
        self
    }

    /// Decodes one packet from the front of `buf`
    ///
    /// Consumes the packet's bytes only when a whole packet was decoded.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` for an invalid header or body, and
    /// `IncomingPacketTooLarge` as soon as the header announces a packet
    /// above `max_incoming`, before its body has arrived
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Packet>> {
        let Some((header, header_len)) = peek_header(buf)? else {
            return Ok(None);
        };

        let packet_len = header_len + header.remaining_length as usize;
        if let Some(max) = self.max_incoming {
            if packet_len > max as usize {
                return Err(MqttError::IncomingPacketTooLarge {
                    size: packet_len,
                    max: max as usize,
                });
            }
        }
        if buf.len() < packet_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(packet_len);
        frame.advance(header_len);
        let packet = Packet::decode_from_body(&header, &mut frame, self.version)?;
        trace!(packet_type = ?header.packet_type, size = packet_len, "Decoded packet");
        Ok(Some(packet))
    }

    /// Appends the encoded packet to `buf`
    ///
    /// # Errors
    ///
    /// `PacketTooLarge` if the packet exceeds `max_outgoing`; `buf` is left
    /// untouched in that case
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<usize> {
        let mut frame = BytesMut::new();
        packet.encode(&mut frame, self.version)?;
        if let Some(max) = self.max_outgoing {
            if frame.len() > max as usize {
                return Err(MqttError::PacketTooLarge {
                    size: frame.len(),
                    max: max as usize,
                });
            }
        }
        let len = frame.len();
        buf.unsplit(frame);
        Ok(len)
    }

    /// Encoded size of `packet` without keeping the bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be encoded
    pub fn encoded_len(&self, packet: &Packet) -> Result<usize> {
        let mut frame = BytesMut::new();
        packet.encode(&mut frame, self.version)?;
        Ok(frame.len())
    }
}

/// Reads the fixed header at the front of `bytes` without consuming it
///
/// Returns the header and its length in bytes, or `None` if the header is
/// not complete yet.
///
/// # Errors
///
/// Returns `MalformedPacket` for an unknown type, a reserved flag violation
/// or a remaining length longer than four bytes
pub fn peek_header(bytes: &[u8]) -> Result<Option<(FixedHeader, usize)>> {
    let Some(&first) = bytes.first() else {
        return Ok(None);
    };
    let (type_and_flags, _) = MqttTypeAndFlags::try_from_be_bytes(&[first])?;
    let packet_type = type_and_flags.packet_type().ok_or_else(|| {
        MqttError::MalformedPacket(format!(
            "Invalid packet type {}",
            type_and_flags.message_type
        ))
    })?;
    let header = FixedHeader::new(packet_type, type_and_flags.flags(), 0);
    header.validate_flags()?;

    let Some((remaining_length, len_bytes)) = try_decode_variable_int(&bytes[1..])? else {
        return Ok(None);
    };
    Ok(Some((
        FixedHeader {
            remaining_length,
            ..header
        },
        1 + len_bytes,
    )))
}

/// Encodes a single packet into a fresh buffer
///
/// # Errors
///
/// Returns an error if the packet cannot be encoded
pub fn encode_packet(packet: &Packet, version: ProtocolVersion) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    PacketCodec::new(version).encode(packet, &mut buf)?;
    Ok(buf)
}

/// Decodes a buffer holding exactly one packet
///
/// # Errors
///
/// Returns `MalformedPacket` if the buffer is truncated, malformed or holds
/// trailing bytes
pub fn decode_packet(bytes: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let mut buf = BytesMut::from(bytes);
    let packet = PacketCodec::new(version)
        .decode(&mut buf)?
        .ok_or_else(|| MqttError::MalformedPacket("Truncated packet".to_string()))?;
    if !buf.is_empty() {
        return Err(MqttError::MalformedPacket(format!(
            "{} bytes after the packet",
            buf.len()
        )));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PubAckPacket, PublishPacket};
    use crate::QoS;

    fn publish_bytes(payload_len: usize) -> BytesMut {
        let packet = Packet::Publish(
            PublishPacket::new("t/1", vec![0xAB; payload_len], QoS::AtLeastOnce).with_packet_id(5),
        );
        encode_packet(&packet, ProtocolVersion::V5).unwrap()
    }

    #[test]
    fn test_decode_is_resumable_byte_by_byte() {
        let wire = publish_bytes(300);
        let codec = PacketCodec::new(ProtocolVersion::V5);
        let mut buf = BytesMut::new();

        for (i, byte) in wire.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
                assert_eq!(buf.len(), i + 1);
            } else {
                assert_eq!(decoded.unwrap().packet_id(), Some(5));
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn test_decode_two_packets_in_one_buffer() {
        let codec = PacketCodec::new(ProtocolVersion::V311);
        let mut buf = encode_packet(&Packet::PubAck(PubAckPacket::new(1)), ProtocolVersion::V311)
            .unwrap();
        buf.extend_from_slice(&[0xD0, 0x00]);

        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Packet::PubAck(_))));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingResp));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_incoming_limit_checked_from_header() {
        let codec = PacketCodec::new(ProtocolVersion::V5).with_max_incoming(Some(64));
        let wire = publish_bytes(200);
        let mut partial = BytesMut::from(&wire[..4]);
        assert!(matches!(
            codec.decode(&mut partial),
            Err(MqttError::IncomingPacketTooLarge { max: 64, .. })
        ));
    }

    #[test]
    fn test_outgoing_limit_leaves_buffer_untouched() {
        let codec = PacketCodec::new(ProtocolVersion::V5).with_max_outgoing(Some(32));
        let packet = Packet::Publish(PublishPacket::new("t", vec![0u8; 64], QoS::AtMostOnce));
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(&packet, &mut buf),
            Err(MqttError::PacketTooLarge { max: 32, .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_errors() {
        assert!(peek_header(&[0x00, 0x00]).is_err());
        assert!(peek_header(&[0x63, 0x02]).is_err());
        assert!(peek_header(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert_eq!(peek_header(&[0x30, 0xFF]).unwrap(), None);
        assert_eq!(peek_header(&[]).unwrap(), None);
    }

    #[test]
    fn test_decode_packet_rejects_trailing_bytes() {
        let mut wire = publish_bytes(4);
        wire.extend_from_slice(&[0x00]);
        assert!(decode_packet(&wire, ProtocolVersion::V5).is_err());
    }
}
