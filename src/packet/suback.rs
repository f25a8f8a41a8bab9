use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut};

/// MQTT SUBACK packet
///
/// One reason code per filter of the SUBSCRIBE it answers, in order. The
/// 3.1.1 return codes 0x00-0x02 and 0x80 share their values with v5.0 and
/// are kept in the same type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl SubAckPacket {
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

    #[must_use]
    pub fn add_granted_qos(self, qos: QoS) -> Self {
        let code = match qos {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        };
        self.add_reason_code(code)
    }

    /// Granted `QoS` per filter, `None` where the subscription was refused
    #[must_use]
    pub fn granted_qos(&self) -> Vec<Option<QoS>> {
        self.reason_codes
            .iter()
            .map(|code| match code {
                ReasonCode::Success => Some(QoS::AtMostOnce),
                ReasonCode::GrantedQoS1 => Some(QoS::AtLeastOnce),
                ReasonCode::GrantedQoS2 => Some(QoS::ExactlyOnce),
                _ => None,
            })
            .collect()
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u16(self.packet_id);
        if version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }
        for code in &self.reason_codes {
            let value = match (version, code.is_error()) {
                (ProtocolVersion::V311, true) => 0x80,
                _ => u8::from(*code),
            };
            buf.put_u8(value);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = super::decode_packet_id(buf, PacketType::SubAck)?;
        let properties = if version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::new()
        };

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "SUBACK packet must contain at least one reason code".to_string(),
            ));
        }

        let mut reason_codes = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            let value = buf.get_u8();
            let code = match version {
                ProtocolVersion::V311 => match value {
                    0x00 => ReasonCode::Success,
                    0x01 => ReasonCode::GrantedQoS1,
                    0x02 => ReasonCode::GrantedQoS2,
                    0x80 => ReasonCode::UnspecifiedError,
                    other => {
                        return Err(MqttError::MalformedPacket(format!(
                            "Invalid SUBACK return code 0x{other:02X}"
                        )))
                    }
                },
                ProtocolVersion::V5 => ReasonCode::decode_for(value, PacketType::SubAck)?,
            };
            reason_codes.push(code);
        }

        Ok(Self {
            packet_id,
            reason_codes,
            properties,
        })
    }
}
