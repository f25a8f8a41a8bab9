//! PUBACK, PUBREC, PUBREL and PUBCOMP
//!
//! All four share one layout: a packet identifier, then (v5 only) an
//! optional reason code and an optional property block. The reason code is
//! only written when it is not Success or when properties follow.

use crate::error::Result;
use crate::packet::{decode_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::ProtocolVersion;
use bebytes::BeBytes;
use bytes::{Buf, BufMut};

/// Packet identifier and reason code as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct AckPacketHeader {
    #[bebytes(big_endian)]
    pub packet_id: u16,
    pub reason_code: u8,
}

fn encode_ack<B: BufMut>(
    buf: &mut B,
    packet_id: u16,
    reason_code: ReasonCode,
    properties: &Properties,
    version: ProtocolVersion,
) -> Result<()> {
    if version == ProtocolVersion::V311
        || (reason_code == ReasonCode::Success && properties.is_empty())
    {
        buf.put_u16(packet_id);
        return Ok(());
    }

    let header = AckPacketHeader {
        packet_id,
        reason_code: u8::from(reason_code),
    };
    buf.put_slice(&header.to_be_bytes());
    if !properties.is_empty() {
        properties.encode(buf)?;
    }
    Ok(())
}

fn decode_ack<B: Buf>(
    buf: &mut B,
    packet_type: PacketType,
    version: ProtocolVersion,
) -> Result<(u16, ReasonCode, Properties)> {
    let packet_id = decode_packet_id(buf, packet_type)?;

    if version == ProtocolVersion::V311 || !buf.has_remaining() {
        return Ok((packet_id, ReasonCode::Success, Properties::new()));
    }

    let reason_code = ReasonCode::decode_for(buf.get_u8(), packet_type)?;
    let properties = if buf.has_remaining() {
        Properties::decode(buf)?
    } else {
        Properties::new()
    };
    Ok((packet_id, reason_code, properties))
}

macro_rules! ack_packet {
    ($(#[$doc:meta])* $name:ident, $packet_type:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
            pub reason_code: ReasonCode,
            /// v5.0 only
            pub properties: Properties,
        }

        impl $name {
            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self::with_reason(packet_id, ReasonCode::Success)
            }

            #[must_use]
            pub fn with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
                Self {
                    packet_id,
                    reason_code,
                    properties: Properties::new(),
                }
            }

            #[must_use]
            pub fn with_reason_string(mut self, reason: impl Into<String>) -> Self {
                self.properties.set_reason_string(reason.into());
                self
            }
        }

        impl MqttPacket for $name {
            fn packet_type(&self) -> PacketType {
                $packet_type
            }

            fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
                encode_ack(buf, self.packet_id, self.reason_code, &self.properties, version)
            }

            fn decode_body<B: Buf>(
                buf: &mut B,
                _fixed_header: &FixedHeader,
                version: ProtocolVersion,
            ) -> Result<Self> {
                let (packet_id, reason_code, properties) = decode_ack(buf, $packet_type, version)?;
                Ok(Self {
                    packet_id,
                    reason_code,
                    properties,
                })
            }
        }
    };
}

ack_packet!(
    /// `QoS` 1 publish acknowledgment
    PubAckPacket,
    PacketType::PubAck
);
ack_packet!(
    /// `QoS` 2 publish received, first step of the handshake
    PubRecPacket,
    PacketType::PubRec
);
ack_packet!(
    /// `QoS` 2 publish release
    PubRelPacket,
    PacketType::PubRel
);
ack_packet!(
    /// `QoS` 2 publish complete, final step of the handshake
    PubCompPacket,
    PacketType::PubComp
);
