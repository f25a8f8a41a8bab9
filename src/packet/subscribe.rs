use crate::constants::subscription::QOS_MASK;
use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::{ProtocolVersion, QoS};
use bebytes::BeBytes;
use bytes::{Buf, BufMut};

/// Per-filter subscription options
///
/// Only `qos` exists in 3.1.1; the other fields are written for v5.0
/// sessions and ignored otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe = 0,
    SendAtSubscribeIfNew = 1,
    DoNotSend = 2,
}

/// The options byte, bits 7-0 from MSB to LSB
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
struct SubscriptionOptionsBits {
    #[bits(2)]
    reserved_bits: u8,
    #[bits(2)]
    retain_handling: u8,
    #[bits(1)]
    retain_as_published: u8,
    #[bits(1)]
    no_local: u8,
    #[bits(2)]
    qos: u8,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::new(QoS::AtMostOnce)
    }
}

impl SubscriptionOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::SendAtSubscribe,
        }
    }

    #[must_use]
    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    #[must_use]
    pub fn with_retain_as_published(mut self, retain_as_published: bool) -> Self {
        self.retain_as_published = retain_as_published;
        self
    }

    #[must_use]
    pub fn with_retain_handling(mut self, retain_handling: RetainHandling) -> Self {
        self.retain_handling = retain_handling;
        self
    }

    /// Encodes the options byte for `version`
    #[must_use]
    pub fn encode(&self, version: ProtocolVersion) -> u8 {
        if version == ProtocolVersion::V311 {
            return u8::from(self.qos);
        }
        let bits = SubscriptionOptionsBits {
            reserved_bits: 0,
            retain_handling: self.retain_handling as u8,
            retain_as_published: u8::from(self.retain_as_published),
            no_local: u8::from(self.no_local),
            qos: u8::from(self.qos),
        };
        bits.to_be_bytes()[0]
    }

    /// Decodes the options byte
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` for `QoS` 3, retain handling 3 or any reserved
    /// bit set. In 3.1.1 everything above the `QoS` bits is reserved.
    pub fn decode(byte: u8, version: ProtocolVersion) -> Result<Self> {
        if version == ProtocolVersion::V311 {
            if byte & !QOS_MASK != 0 {
                return Err(MqttError::MalformedPacket(format!(
                    "Reserved bits set in 3.1.1 requested QoS byte 0x{byte:02X}"
                )));
            }
            return Ok(Self::new(QoS::try_from(byte)?));
        }

        let (bits, _) = SubscriptionOptionsBits::try_from_be_bytes(&[byte])?;
        if bits.reserved_bits != 0 {
            return Err(MqttError::MalformedPacket(
                "Reserved bits in subscription options must be 0".to_string(),
            ));
        }
        let retain_handling = match bits.retain_handling {
            0 => RetainHandling::SendAtSubscribe,
            1 => RetainHandling::SendAtSubscribeIfNew,
            2 => RetainHandling::DoNotSend,
            other => {
                return Err(MqttError::MalformedPacket(format!(
                    "Invalid retain handling value: {other}"
                )))
            }
        };

        Ok(Self {
            qos: QoS::try_from(bits.qos)?,
            no_local: bits.no_local != 0,
            retain_as_published: bits.retain_as_published != 0,
            retain_handling,
        })
    }
}

/// Topic filter with subscription options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl TopicFilter {
    #[must_use]
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            options: SubscriptionOptions::new(qos),
        }
    }

    #[must_use]
    pub fn with_options(filter: impl Into<String>, options: SubscriptionOptions) -> Self {
        Self {
            filter: filter.into(),
            options,
        }
    }
}

/// MQTT SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
    pub properties: Properties,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.filters.push(TopicFilter::new(filter, qos));
        self
    }

    #[must_use]
    pub fn add_filter_with_options(mut self, filter: TopicFilter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_subscription_identifier(mut self, id: u32) -> Self {
        self.properties.add_subscription_identifier(id);
        self
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE packet must contain at least one topic filter".to_string(),
            ));
        }

        buf.put_u16(self.packet_id);
        if version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }

        for filter in &self.filters {
            encode_string(buf, &filter.filter)?;
            buf.put_u8(filter.options.encode(version));
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = super::decode_packet_id(buf, PacketType::Subscribe)?;
        let properties = if version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::new()
        };

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE packet must contain at least one topic filter".to_string(),
            ));
        }

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(
                    "Missing subscription options for topic filter".to_string(),
                ));
            }
            let options = SubscriptionOptions::decode(buf.get_u8(), version)?;
            filters.push(TopicFilter { filter, options });
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }
}
