pub mod ack;
pub mod auth;
pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

#[cfg(test)]
mod property_tests;

pub use ack::{PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket};
pub use auth::AuthPacket;
pub use connack::ConnAckPacket;
pub use connect::ConnectPacket;
pub use disconnect::DisconnectPacket;
pub use publish::PublishPacket;
pub use suback::SubAckPacket;
pub use subscribe::{RetainHandling, SubscribePacket, SubscriptionOptions, TopicFilter};
pub use unsuback::UnsubAckPacket;
pub use unsubscribe::UnsubscribePacket;

use crate::constants::fixed_header::RESERVED_0010;
use crate::encoding::{decode_variable_int, encode_variable_int, variable_int_len};
use crate::error::{MqttError, Result};
use crate::ProtocolVersion;
use bebytes::BeBytes;
use bytes::{Buf, BufMut};

/// First byte of every fixed header, split into its bit fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct MqttTypeAndFlags {
    /// Message type (bits 7-4)
    #[bits(4)]
    pub message_type: u8,
    /// DUP flag (bit 3), PUBLISH only
    #[bits(1)]
    pub dup: u8,
    /// `QoS` level (bits 2-1), PUBLISH only
    #[bits(2)]
    pub qos: u8,
    /// RETAIN flag (bit 0), PUBLISH only
    #[bits(1)]
    pub retain: u8,
}

impl MqttTypeAndFlags {
    #[must_use]
    pub fn create(packet_type: PacketType, flags: u8) -> Self {
        Self {
            message_type: u8::from(packet_type),
            dup: (flags >> 3) & 0x01,
            qos: (flags >> 1) & 0x03,
            retain: flags & 0x01,
        }
    }

    /// Reassembles the low nibble
    #[must_use]
    pub fn flags(&self) -> u8 {
        (self.dup << 3) | (self.qos << 1) | self.retain
    }

    #[must_use]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.message_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BeBytes)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::try_from(value).ok()
    }

    /// Flags every packet of this type must carry, `None` for PUBLISH whose
    /// flags are variable
    #[must_use]
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => {
                Some(RESERVED_0010)
            }
            _ => Some(0),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// MQTT packet fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Encodes the fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if the remaining length is too large
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let first = MqttTypeAndFlags::create(self.packet_type, self.flags);
        buf.put_slice(&first.to_be_bytes());
        encode_variable_int(buf, self.remaining_length)
    }

    /// Decodes a fixed header from a buffer holding at least the full header
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` for a missing or unknown type, reserved flag
    /// violations, or a bad remaining length
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "No data for fixed header".to_string(),
            ));
        }

        let (first, _) = MqttTypeAndFlags::try_from_be_bytes(&[buf.get_u8()])?;
        let packet_type = first.packet_type().ok_or_else(|| {
            MqttError::MalformedPacket(format!("Invalid packet type {}", first.message_type))
        })?;
        let remaining_length = decode_variable_int(buf)?;

        let header = Self {
            packet_type,
            flags: first.flags(),
            remaining_length,
        };
        header.validate_flags()?;
        Ok(header)
    }

    /// Checks the reserved flag bits for the packet type
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` when reserved bits differ from their required value
    pub fn validate_flags(&self) -> Result<()> {
        match self.packet_type.required_flags() {
            Some(required) if required != self.flags => Err(MqttError::MalformedPacket(format!(
                "Invalid flags 0x{:X} for {:?}",
                self.flags, self.packet_type
            ))),
            _ => Ok(()),
        }
    }

    /// Size of the fixed header itself
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + variable_int_len(self.remaining_length)
    }

    /// Size of the whole packet this header describes
    #[must_use]
    pub fn packet_len(&self) -> usize {
        self.encoded_len() + self.remaining_length as usize
    }
}

/// Every MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// Packet identifier, for the packet types that carry one
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PubAck(p) => Some(p.packet_id),
            Packet::PubRec(p) => Some(p.packet_id),
            Packet::PubRel(p) => Some(p.packet_id),
            Packet::PubComp(p) => Some(p.packet_id),
            Packet::Subscribe(p) => Some(p.packet_id),
            Packet::SubAck(p) => Some(p.packet_id),
            Packet::Unsubscribe(p) => Some(p.packet_id),
            Packet::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// Encodes the complete packet, fixed header included
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be represented on the wire or the
    /// packet does not exist in `version`
    pub fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        match self {
            Packet::Connect(p) => p.encode(buf, version),
            Packet::ConnAck(p) => p.encode(buf, version),
            Packet::Publish(p) => p.encode(buf, version),
            Packet::PubAck(p) => p.encode(buf, version),
            Packet::PubRec(p) => p.encode(buf, version),
            Packet::PubRel(p) => p.encode(buf, version),
            Packet::PubComp(p) => p.encode(buf, version),
            Packet::Subscribe(p) => p.encode(buf, version),
            Packet::SubAck(p) => p.encode(buf, version),
            Packet::Unsubscribe(p) => p.encode(buf, version),
            Packet::UnsubAck(p) => p.encode(buf, version),
            Packet::PingReq => FixedHeader::new(PacketType::PingReq, 0, 0).encode(buf),
            Packet::PingResp => FixedHeader::new(PacketType::PingResp, 0, 0).encode(buf),
            Packet::Disconnect(p) => p.encode(buf, version),
            Packet::Auth(p) => p.encode(buf, version),
        }
    }

    /// Decodes a packet body whose bytes are exactly `fixed_header.remaining_length` long
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the body is inconsistent with the header,
    /// a field is truncated, or bytes are left over after the last field
    pub fn decode_from_body<B: Buf>(
        fixed_header: &FixedHeader,
        buf: &mut B,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if buf.remaining() != fixed_header.remaining_length as usize {
            return Err(MqttError::MalformedPacket(format!(
                "Remaining length {} does not match body of {} bytes",
                fixed_header.remaining_length,
                buf.remaining()
            )));
        }

        let packet = match fixed_header.packet_type {
            PacketType::Connect => {
                Packet::Connect(Box::new(ConnectPacket::decode_body(buf, fixed_header, version)?))
            }
            PacketType::ConnAck => {
                Packet::ConnAck(ConnAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::Publish => {
                Packet::Publish(PublishPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubAck => {
                Packet::PubAck(PubAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubRec => {
                Packet::PubRec(PubRecPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubRel => {
                Packet::PubRel(PubRelPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubComp => {
                Packet::PubComp(PubCompPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::Subscribe => {
                Packet::Subscribe(SubscribePacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::SubAck => {
                Packet::SubAck(SubAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(UnsubscribePacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::UnsubAck => {
                Packet::UnsubAck(UnsubAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => {
                Packet::Disconnect(DisconnectPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::Auth => Packet::Auth(AuthPacket::decode_body(buf, fixed_header, version)?),
        };

        if buf.has_remaining() {
            return Err(MqttError::MalformedPacket(format!(
                "{} unexpected trailing bytes in {:?}",
                buf.remaining(),
                fixed_header.packet_type
            )));
        }
        Ok(packet)
    }
}

/// Encoding and decoding of one control packet type
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    /// Low nibble of the first header byte
    fn flags(&self) -> u8 {
        self.packet_type().required_flags().unwrap_or(0)
    }

    /// Encodes the variable header and payload
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be represented on the wire
    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()>;

    /// Decodes the variable header and payload
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the body is truncated or inconsistent
    fn decode_body<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self>;

    /// Encodes the complete packet (with fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the body exceeds the maximum remaining length
    fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        let mut body = Vec::new();
        self.encode_body(&mut body, version)?;

        let remaining_length = u32::try_from(body.len()).map_err(|_| MqttError::PacketTooLarge {
            size: body.len(),
            max: crate::encoding::VARIABLE_INT_MAX as usize,
        })?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}

/// Reads the two byte packet identifier that opens most variable headers.
pub(crate) fn decode_packet_id<B: Buf>(buf: &mut B, packet_type: PacketType) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} missing packet identifier"
        )));
    }
    let packet_id = buf.get_u16();
    if packet_id == 0 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} packet identifier must be non-zero"
        )));
    }
    Ok(packet_id)
}
