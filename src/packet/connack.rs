use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT CONNACK packet
///
/// v3.1.1 return codes 1-5 are mapped onto their v5.0 reason code
/// equivalents so callers only deal with one code space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    /// v5.0 only
    pub properties: Properties,
}

impl ConnAckPacket {
    /// Creates a CONNACK without properties
    #[must_use]
    pub fn new(session_present: bool, reason_code: ReasonCode) -> Self {
        Self {
            session_present,
            reason_code,
            properties: Properties::new(),
        }
    }

    /// Sets the maximum packet size the server accepts
    #[must_use]
    pub fn with_maximum_packet_size(mut self, size: u32) -> Self {
        self.properties.set_maximum_packet_size(size);
        self
    }

    /// Sets the keep-alive the server imposes
    #[must_use]
    pub fn with_server_keep_alive(mut self, seconds: u16) -> Self {
        self.properties.set_server_keep_alive(seconds);
        self
    }

    /// Sets how many unacknowledged `QoS` 1/2 publishes the server accepts
    #[must_use]
    pub fn with_receive_maximum(mut self, max: u16) -> Self {
        self.properties.set_receive_maximum(max);
        self
    }

    /// Gets the maximum packet size the server accepts
    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.properties.maximum_packet_size()
    }

    /// Gets the server receive maximum
    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        self.properties.receive_maximum()
    }

    /// Gets the keep-alive the server imposes
    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        self.properties.server_keep_alive()
    }

    fn v311_return_code(code: ReasonCode) -> u8 {
        match code {
            ReasonCode::Success => 0,
            ReasonCode::UnsupportedProtocolVersion => 1,
            ReasonCode::ClientIdentifierNotValid => 2,
            ReasonCode::BadUsernameOrPassword => 4,
            ReasonCode::NotAuthorized => 5,
            _ => 3,
        }
    }

    fn from_v311_return_code(code: u8) -> Result<ReasonCode> {
        Ok(match code {
            0 => ReasonCode::Success,
            1 => ReasonCode::UnsupportedProtocolVersion,
            2 => ReasonCode::ClientIdentifierNotValid,
            3 => ReasonCode::ServerUnavailable,
            4 => ReasonCode::BadUsernameOrPassword,
            5 => ReasonCode::NotAuthorized,
            other => {
                return Err(MqttError::MalformedPacket(format!(
                    "Invalid CONNACK return code {other}"
                )))
            }
        })
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u8(u8::from(self.session_present));
        match version {
            ProtocolVersion::V311 => buf.put_u8(Self::v311_return_code(self.reason_code)),
            ProtocolVersion::V5 => {
                buf.put_u8(u8::from(self.reason_code));
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
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK shorter than 2 bytes".to_string(),
            ));
        }

        let ack_flags = buf.get_u8();
        if ack_flags & 0xFE != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNACK acknowledge flags reserved bits set".to_string(),
            ));
        }

        let code = buf.get_u8();
        let (reason_code, properties) = match version {
            ProtocolVersion::V311 => (Self::from_v311_return_code(code)?, Properties::new()),
            ProtocolVersion::V5 => {
                let reason_code = ReasonCode::decode_for(code, PacketType::ConnAck)?;
                let properties = if buf.has_remaining() {
                    Properties::decode(buf)?
                } else {
                    Properties::new()
                };
                (reason_code, properties)
            }
        };

        Ok(Self {
            session_present: ack_flags & 0x01 != 0,
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

    fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<Packet> {
        let mut buf = BytesMut::from(bytes);
        let header = FixedHeader::decode(&mut buf)?;
        Packet::decode_from_body(&header, &mut buf, version)
    }

    #[test]
    fn test_v311_wire_format() {
        let mut buf = BytesMut::new();
        ConnAckPacket::new(true, ReasonCode::Success)
            .encode(&mut buf, ProtocolVersion::V311)
            .unwrap();
        assert_eq!(&buf[..], &[0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_v311_return_codes_map_to_reason_codes() {
        let Packet::ConnAck(ack) = decode(&[0x20, 0x02, 0x00, 0x04], ProtocolVersion::V311).unwrap()
        else {
            panic!("expected CONNACK");
        };
        assert_eq!(ack.reason_code, ReasonCode::BadUsernameOrPassword);
        assert!(!ack.session_present);

        assert!(decode(&[0x20, 0x02, 0x00, 0x06], ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_v5_round_trip_with_limits() {
        let packet = Packet::ConnAck(
            ConnAckPacket::new(false, ReasonCode::Success)
                .with_maximum_packet_size(512)
                .with_server_keep_alive(30)
                .with_receive_maximum(5),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        let decoded = decode(&buf, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, packet);

        let Packet::ConnAck(ack) = decoded else {
            panic!("expected CONNACK");
        };
        assert_eq!(ack.maximum_packet_size(), Some(512));
        assert_eq!(ack.server_keep_alive(), Some(30));
        assert_eq!(ack.receive_maximum(), Some(5));
    }

    #[test]
    fn test_reserved_ack_flags_rejected() {
        assert!(decode(&[0x20, 0x03, 0x02, 0x00, 0x00], ProtocolVersion::V5).is_err());
    }
}
