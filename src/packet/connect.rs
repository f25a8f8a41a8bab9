use crate::constants::{connect_flags, PROTOCOL_NAME};
use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::types::{ConnectOptions, WillMessage};
use crate::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut, Bytes};

/// MQTT CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    /// Clean Start in v5.0, Clean Session in v3.1.1
    pub clean_start: bool,
    /// Keep alive interval in seconds, 0 disables
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<WillMessage>,
    /// v5.0 only
    pub properties: Properties,
}

impl ConnectPacket {
    /// Builds the CONNECT for a set of client options
    #[must_use]
    pub fn from_options(options: &ConnectOptions) -> Self {
        let mut properties = Properties::new();
        if options.protocol_version == ProtocolVersion::V5 {
            if let Some(interval) = options.session_expiry_interval {
                properties.set_session_expiry_interval(interval);
            }
            if let Some(receive_maximum) = options.receive_maximum {
                properties.set_receive_maximum(receive_maximum);
            }
            if let Some(max) = options.maximum_packet_size {
                properties.set_maximum_packet_size(max);
            }
        }

        let will = options.will.clone().map(|mut will| {
            if options.protocol_version == ProtocolVersion::V311 {
                will.properties = Properties::new();
            }
            will
        });

        Self {
            protocol_version: options.protocol_version,
            clean_start: options.clean_start,
            keep_alive: u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX),
            client_id: options.client_id.clone(),
            username: options.username.clone(),
            password: options.password.clone(),
            will,
            properties,
        }
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_start {
            flags |= connect_flags::CLEAN_START;
        }
        if let Some(will) = &self.will {
            flags |= connect_flags::WILL_FLAG;
            flags |= (u8::from(will.qos) & connect_flags::WILL_QOS_MASK)
                << connect_flags::WILL_QOS_SHIFT;
            if will.retain {
                flags |= connect_flags::WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= connect_flags::USERNAME;
        }
        if self.password.is_some() {
            flags |= connect_flags::PASSWORD;
        }
        flags
    }

    fn decode_protocol_header<B: Buf>(buf: &mut B) -> Result<ProtocolVersion> {
        let name = decode_string(buf)?;
        if name != PROTOCOL_NAME {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid protocol name: {name}"
            )));
        }
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing protocol version".to_string(),
            ));
        }
        let level = buf.get_u8();
        ProtocolVersion::from_u8(level).ok_or_else(|| {
            MqttError::MalformedPacket(format!("Unsupported protocol version {level}"))
        })
    }

    fn decode_will<B: Buf>(
        buf: &mut B,
        flags: u8,
        version: ProtocolVersion,
    ) -> Result<Option<WillMessage>> {
        let qos_bits = (flags >> connect_flags::WILL_QOS_SHIFT) & connect_flags::WILL_QOS_MASK;
        let retain = flags & connect_flags::WILL_RETAIN != 0;

        if flags & connect_flags::WILL_FLAG == 0 {
            if qos_bits != 0 || retain {
                return Err(MqttError::MalformedPacket(
                    "Will QoS/retain set without will flag".to_string(),
                ));
            }
            return Ok(None);
        }

        let qos = QoS::try_from(qos_bits)?;
        let properties = if version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::new()
        };
        let topic = decode_string(buf)?;
        let payload = decode_binary(buf)?;

        Ok(Some(WillMessage {
            topic,
            payload,
            qos,
            retain,
            properties,
        }))
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    // CONNECT always describes its own version; the connection's version is ignored.
    fn encode_body<B: BufMut>(&self, buf: &mut B, _version: ProtocolVersion) -> Result<()> {
        let version = self.protocol_version;
        encode_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(u8::from(version));
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);
        if version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }

        encode_string(buf, &self.client_id)?;
        if let Some(will) = &self.will {
            if version == ProtocolVersion::V5 {
                will.properties.encode(buf)?;
            }
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }
        if let Some(username) = &self.username {
            encode_string(buf, username)?;
        }
        if let Some(password) = &self.password {
            encode_binary(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        _version: ProtocolVersion,
    ) -> Result<Self> {
        let protocol_version = Self::decode_protocol_header(buf)?;

        if buf.remaining() < 3 {
            return Err(MqttError::MalformedPacket(
                "Missing connect flags or keep alive".to_string(),
            ));
        }
        let flags = buf.get_u8();
        if flags & connect_flags::RESERVED != 0 {
            return Err(MqttError::MalformedPacket(
                "Reserved connect flag bit must be 0".to_string(),
            ));
        }
        let keep_alive = buf.get_u16();

        let properties = if protocol_version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::new()
        };

        let client_id = decode_string(buf)?;
        let will = Self::decode_will(buf, flags, protocol_version)?;

        let has_username = flags & connect_flags::USERNAME != 0;
        let has_password = flags & connect_flags::PASSWORD != 0;
        if protocol_version == ProtocolVersion::V311 && has_password && !has_username {
            return Err(MqttError::MalformedPacket(
                "Password flag set without username flag".to_string(),
            ));
        }
        let username = has_username.then(|| decode_string(buf)).transpose()?;
        let password = has_password.then(|| decode_binary(buf)).transpose()?;

        Ok(Self {
            protocol_version,
            clean_start: flags & connect_flags::CLEAN_START != 0,
            keep_alive,
            client_id,
            username,
            password,
            will,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use bytes::BytesMut;
    use std::time::Duration;

    fn decode(buf: &mut BytesMut) -> Result<Packet> {
        let header = FixedHeader::decode(buf)?;
        Packet::decode_from_body(&header, buf, ProtocolVersion::V5)
    }

    #[test]
    fn test_v311_connect_wire_format() {
        let options = ConnectOptions::new("c1")
            .with_protocol_version(ProtocolVersion::V311)
            .with_keep_alive(Duration::from_secs(60));
        let packet = ConnectPacket::from_options(&options);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V311).unwrap();
        assert_eq!(
            &buf[..],
            &[
                0x10, 14, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 60, 0x00, 0x02,
                b'c', b'1'
            ]
        );
    }

    #[test]
    fn test_v5_connect_round_trip_with_will_and_credentials() {
        let mut will = WillMessage::new("status/c1", &b"offline"[..]).with_qos(QoS::AtLeastOnce);
        will.retain = true;
        will.properties.set_will_delay_interval(5);

        let options = ConnectOptions::new("c1")
            .with_clean_start(false)
            .with_credentials("user", &b"secret"[..])
            .with_will(will)
            .with_session_expiry_interval(120)
            .with_receive_maximum(10);
        let packet = Packet::Connect(Box::new(ConnectPacket::from_options(&options)));

        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        let decoded = decode(&mut buf).unwrap();
        assert_eq!(decoded, packet);

        let Packet::Connect(connect) = decoded else {
            panic!("expected CONNECT");
        };
        assert_eq!(connect.properties.session_expiry_interval(), Some(120));
        assert_eq!(connect.will.unwrap().qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_wrong_protocol_name_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        buf.put_u8(12);
        encode_string(&mut buf, "MQIs").unwrap();
        buf.put_slice(&[0x04, 0x02, 0x00, 0x3C, 0x00, 0x00]);
        assert!(matches!(decode(&mut buf), Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_unsupported_version_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        buf.put_u8(12);
        encode_string(&mut buf, "MQTT").unwrap();
        buf.put_slice(&[0x03, 0x02, 0x00, 0x3C, 0x00, 0x00]);
        assert!(matches!(decode(&mut buf), Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_reserved_flag_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        buf.put_u8(12);
        encode_string(&mut buf, "MQTT").unwrap();
        buf.put_slice(&[0x04, 0x03, 0x00, 0x3C, 0x00, 0x00]);
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_v311_omits_properties() {
        let options = ConnectOptions::new("c")
            .with_protocol_version(ProtocolVersion::V311)
            .with_session_expiry_interval(30);
        let packet = ConnectPacket::from_options(&options);
        assert!(packet.properties.is_empty());
    }
}
