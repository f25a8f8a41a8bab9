use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, MqttTypeAndFlags, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut, Bytes};

/// MQTT PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// Present exactly when `qos` is above `AtMostOnce`
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// v5.0 only
    pub properties: Properties,
}

impl PublishPacket {
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            properties: Properties::new(),
        }
    }

    /// Sets the packet identifier; ignored at `QoS` 0
    #[must_use]
    pub fn with_packet_id(mut self, id: u16) -> Self {
        if self.qos != QoS::AtMostOnce {
            self.packet_id = Some(id);
        }
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    #[must_use]
    pub fn with_message_expiry_interval(mut self, seconds: u32) -> Self {
        self.properties.set_message_expiry_interval(seconds);
        self
    }

    #[must_use]
    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.add_user_property(key, value);
        self
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        MqttTypeAndFlags {
            message_type: u8::from(PacketType::Publish),
            dup: u8::from(self.dup),
            qos: u8::from(self.qos),
            retain: u8::from(self.retain),
        }
        .flags()
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        encode_string(buf, &self.topic_name)?;

        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.filter(|id| *id != 0).ok_or_else(|| {
                MqttError::MalformedPacket("Packet ID required for QoS > 0".to_string())
            })?;
            buf.put_u16(packet_id);
        }

        if version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }

        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let flags = MqttTypeAndFlags::create(PacketType::Publish, fixed_header.flags);
        let qos = QoS::try_from(flags.qos)?;
        let dup = flags.dup != 0;
        if qos == QoS::AtMostOnce && dup {
            return Err(MqttError::MalformedPacket(
                "DUP flag set on a QoS 0 PUBLISH".to_string(),
            ));
        }

        let topic_name = decode_string(buf)?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(super::decode_packet_id(buf, PacketType::Publish)?)
        };

        let properties = if version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::new()
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain: flags.retain != 0,
            dup,
            properties,
        })
    }
}
