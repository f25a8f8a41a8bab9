use crate::error::Result;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT UNSUBACK packet
///
/// 3.1.1 UNSUBACK carries only the packet identifier, so `reason_codes` is
/// empty for that version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl UnsubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_codes: Vec::new(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn add_reason_code(mut self, code: ReasonCode) -> Self {
        self.reason_codes.push(code);
        self
    }
}

impl MqttPacket for UnsubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::UnsubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u16(self.packet_id);
        if version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
            for code in &self.reason_codes {
                buf.put_u8(u8::from(*code));
            }
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = super::decode_packet_id(buf, PacketType::UnsubAck)?;
        if version == ProtocolVersion::V311 {
            return Ok(Self::new(packet_id));
        }

        let properties = Properties::decode(buf)?;
        let mut reason_codes = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            reason_codes.push(ReasonCode::decode_for(buf.get_u8(), PacketType::UnsubAck)?);
        }

        Ok(Self {
            packet_id,
            reason_codes,
            properties,
        })
    }
}
