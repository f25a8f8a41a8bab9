use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{Properties, PropertyId, PropertyValue};
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes};

/// AUTH packet for v5.0 enhanced authentication. Does not exist in 3.1.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl AuthPacket {
    #[must_use]
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::new(),
        }
    }

    /// Continue an exchange with the given method and optional data
    ///
    /// # Errors
    ///
    /// Returns an error if the properties cannot be added
    pub fn continue_authentication(method: impl Into<String>, data: Option<Bytes>) -> Result<Self> {
        let mut packet = Self::new(ReasonCode::ContinueAuthentication);
        packet.properties.add(
            PropertyId::AuthenticationMethod,
            PropertyValue::Utf8String(method.into()),
        )?;
        if let Some(data) = data {
            packet
                .properties
                .add(PropertyId::AuthenticationData, PropertyValue::BinaryData(data))?;
        }
        Ok(packet)
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        match self.properties.get(PropertyId::AuthenticationMethod) {
            Some(PropertyValue::Utf8String(method)) => Some(method),
            _ => None,
        }
    }

    #[must_use]
    pub fn authentication_data(&self) -> Option<&Bytes> {
        match self.properties.get(PropertyId::AuthenticationData) {
            Some(PropertyValue::BinaryData(data)) => Some(data),
            _ => None,
        }
    }
}

impl MqttPacket for AuthPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Auth
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if version == ProtocolVersion::V311 {
            return Err(MqttError::ProtocolError(
                "AUTH is not defined in MQTT 3.1.1".to_string(),
            ));
        }
        if self.reason_code != ReasonCode::Success || !self.properties.is_empty() {
            buf.put_u8(u8::from(self.reason_code));
            self.properties.encode(buf)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if version == ProtocolVersion::V311 {
            return Err(MqttError::MalformedPacket(
                "AUTH is not defined in MQTT 3.1.1".to_string(),
            ));
        }
        if !buf.has_remaining() {
            return Ok(Self::new(ReasonCode::Success));
        }

        let reason_code = ReasonCode::decode_for(buf.get_u8(), PacketType::Auth)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use bytes::BytesMut;

    #[test]
    fn test_auth_round_trip() {
        let packet =
            AuthPacket::continue_authentication("SCRAM-SHA-1", Some(Bytes::from_static(b"nonce")))
                .unwrap();
        let mut buf = BytesMut::new();
        Packet::Auth(packet.clone())
            .encode(&mut buf, ProtocolVersion::V5)
            .unwrap();
        let header = FixedHeader::decode(&mut buf).unwrap();
        let Packet::Auth(decoded) =
            Packet::decode_from_body(&header, &mut buf, ProtocolVersion::V5).unwrap()
        else {
            panic!("expected AUTH");
        };
        assert_eq!(decoded.authentication_method(), Some("SCRAM-SHA-1"));
        assert_eq!(decoded.authentication_data().map(|d| &d[..]), Some(&b"nonce"[..]));
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_auth_rejected_in_v311() {
        let mut buf = BytesMut::from(&[0xF0u8, 0x00][..]);
        let header = FixedHeader::decode(&mut buf).unwrap();
        assert!(matches!(
            Packet::decode_from_body(&header, &mut buf, ProtocolVersion::V311),
            Err(MqttError::MalformedPacket(_))
        ));

        let mut out = BytesMut::new();
        assert!(Packet::Auth(AuthPacket::new(ReasonCode::Success))
            .encode(&mut out, ProtocolVersion::V311)
            .is_err());
    }

    #[test]
    fn test_empty_auth_is_success() {
        let mut buf = BytesMut::from(&[0xF0u8, 0x00][..]);
        let header = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(
            Packet::decode_from_body(&header, &mut buf, ProtocolVersion::V5).unwrap(),
            Packet::Auth(AuthPacket::new(ReasonCode::Success))
        );
    }
}
