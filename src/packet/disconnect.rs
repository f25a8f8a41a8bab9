use crate::error::Result;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::{ReasonCode, NORMAL_DISCONNECTION};
use crate::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT DISCONNECT packet
///
/// Empty in 3.1.1. In v5.0 the reason code and properties are each omitted
/// when they hold their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl DisconnectPacket {
    #[must_use]
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn normal() -> Self {
        Self::new(NORMAL_DISCONNECTION)
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, seconds: u32) -> Self {
        self.properties.set_session_expiry_interval(seconds);
        self
    }

    #[must_use]
    pub fn with_reason_string(mut self, reason: impl Into<String>) -> Self {
        self.properties.set_reason_string(reason.into());
        self
    }
}

impl MqttPacket for DisconnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Disconnect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if version == ProtocolVersion::V311 {
            return Ok(());
        }
        if self.reason_code != NORMAL_DISCONNECTION || !self.properties.is_empty() {
            buf.put_u8(u8::from(self.reason_code));
            if !self.properties.is_empty() {
                self.properties.encode(buf)?;
            }
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        // Anything left in a 3.1.1 body is reported as trailing bytes
        if version == ProtocolVersion::V311 || !buf.has_remaining() {
            return Ok(Self::normal());
        }

        let reason_code = ReasonCode::decode_for(buf.get_u8(), PacketType::Disconnect)?;
        let properties = if buf.has_remaining() {
            Properties::decode(buf)?
        } else {
            Properties::new()
        };

        Ok(Self {
            reason_code,
            properties,
        })
    }
}
