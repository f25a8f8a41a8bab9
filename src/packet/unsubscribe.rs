use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT UNSUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }
}

impl MqttPacket for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE packet must contain at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        if version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }
        for filter in &self.filters {
            encode_string(buf, filter)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = super::decode_packet_id(buf, PacketType::Unsubscribe)?;
        let properties = if version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::new()
        };

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE packet must contain at least one topic filter".to_string(),
            ));
        }

        let mut filters = Vec::new();
        while buf.has_remaining() {
            filters.push(decode_string(buf)?);
        }

        Ok(Self {
            packet_id,
            filters,
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
    fn test_unsubscribe_v311_wire_format() {
        let packet = UnsubscribePacket::new(2).add_filter("a/b");
        let mut buf = BytesMut::new();
        Packet::Unsubscribe(packet.clone())
            .encode(&mut buf, ProtocolVersion::V311)
            .unwrap();
        assert_eq!(&buf[..], &[0xA2, 0x07, 0x00, 0x02, 0x00, 0x03, b'a', b'/', b'b']);

        let header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = Packet::decode_from_body(&header, &mut buf, ProtocolVersion::V311).unwrap();
        assert_eq!(decoded, Packet::Unsubscribe(packet));
    }

    #[test]
    fn test_unsubscribe_v5_with_properties() {
        let mut packet = UnsubscribePacket::new(9)
            .add_filter("x/#")
            .add_filter("y/+");
        packet.properties.add_user_property("origin", "test");
        let mut buf = BytesMut::new();
        Packet::Unsubscribe(packet.clone())
            .encode(&mut buf, ProtocolVersion::V5)
            .unwrap();
        let header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = Packet::decode_from_body(&header, &mut buf, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::Unsubscribe(packet));
    }

    #[test]
    fn test_wrong_flags_rejected() {
        let mut buf = BytesMut::from(&[0xA0u8, 0x05, 0x00, 0x01, 0x00, 0x01, b'a'][..]);
        assert!(FixedHeader::decode(&mut buf).is_err());
    }
}
