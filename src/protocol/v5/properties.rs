use crate::encoding::{
    binary_len, decode_binary, decode_string, decode_variable_int, encode_binary, encode_string,
    encode_variable_int, string_len, variable_int_len,
};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};
use std::collections::BTreeMap;

/// MQTT v5.0 property identifiers, declared in identifier order so that the
/// derived ordering matches the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl PropertyId {
    /// Converts a u8 to a property identifier
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        let id = match value {
            0x01 => Self::PayloadFormatIndicator,
            0x02 => Self::MessageExpiryInterval,
            0x03 => Self::ContentType,
            0x08 => Self::ResponseTopic,
            0x09 => Self::CorrelationData,
            0x0B => Self::SubscriptionIdentifier,
            0x11 => Self::SessionExpiryInterval,
            0x12 => Self::AssignedClientIdentifier,
            0x13 => Self::ServerKeepAlive,
            0x15 => Self::AuthenticationMethod,
            0x16 => Self::AuthenticationData,
            0x17 => Self::RequestProblemInformation,
            0x18 => Self::WillDelayInterval,
            0x19 => Self::RequestResponseInformation,
            0x1A => Self::ResponseInformation,
            0x1C => Self::ServerReference,
            0x1F => Self::ReasonString,
            0x21 => Self::ReceiveMaximum,
            0x22 => Self::TopicAliasMaximum,
            0x23 => Self::TopicAlias,
            0x24 => Self::MaximumQoS,
            0x25 => Self::RetainAvailable,
            0x26 => Self::UserProperty,
            0x27 => Self::MaximumPacketSize,
            0x28 => Self::WildcardSubscriptionAvailable,
            0x29 => Self::SubscriptionIdentifierAvailable,
            0x2A => Self::SharedSubscriptionAvailable,
            _ => return None,
        };
        Some(id)
    }

    /// Only user properties and subscription identifiers may repeat
    #[must_use]
    pub fn allows_multiple(&self) -> bool {
        matches!(self, Self::UserProperty | Self::SubscriptionIdentifier)
    }

    /// Wire type of values under this identifier
    #[must_use]
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            Self::PayloadFormatIndicator
            | Self::RequestProblemInformation
            | Self::RequestResponseInformation
            | Self::MaximumQoS
            | Self::RetainAvailable
            | Self::WildcardSubscriptionAvailable
            | Self::SubscriptionIdentifierAvailable
            | Self::SharedSubscriptionAvailable => PropertyValueType::Byte,

            Self::ServerKeepAlive
            | Self::ReceiveMaximum
            | Self::TopicAliasMaximum
            | Self::TopicAlias => PropertyValueType::TwoByteInteger,

            Self::MessageExpiryInterval
            | Self::SessionExpiryInterval
            | Self::WillDelayInterval
            | Self::MaximumPacketSize => PropertyValueType::FourByteInteger,

            Self::SubscriptionIdentifier => PropertyValueType::VariableByteInteger,

            Self::ContentType
            | Self::ResponseTopic
            | Self::AssignedClientIdentifier
            | Self::AuthenticationMethod
            | Self::ResponseInformation
            | Self::ServerReference
            | Self::ReasonString => PropertyValueType::Utf8String,

            Self::CorrelationData | Self::AuthenticationData => PropertyValueType::BinaryData,

            Self::UserProperty => PropertyValueType::Utf8StringPair,
        }
    }
}

/// Encodings a property value can take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValueType {
    Byte,
    TwoByteInteger,
    FourByteInteger,
    VariableByteInteger,
    BinaryData,
    Utf8String,
    Utf8StringPair,
}

/// A decoded property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInteger(u16),
    FourByteInteger(u32),
    VariableByteInteger(u32),
    BinaryData(Bytes),
    Utf8String(String),
    Utf8StringPair(String, String),
}

impl PropertyValue {
    /// Wire type of this value
    #[must_use]
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            Self::Byte(_) => PropertyValueType::Byte,
            Self::TwoByteInteger(_) => PropertyValueType::TwoByteInteger,
            Self::FourByteInteger(_) => PropertyValueType::FourByteInteger,
            Self::VariableByteInteger(_) => PropertyValueType::VariableByteInteger,
            Self::BinaryData(_) => PropertyValueType::BinaryData,
            Self::Utf8String(_) => PropertyValueType::Utf8String,
            Self::Utf8StringPair(_, _) => PropertyValueType::Utf8StringPair,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Byte(_) => 1,
            Self::TwoByteInteger(_) => 2,
            Self::FourByteInteger(_) => 4,
            Self::VariableByteInteger(v) => variable_int_len(*v),
            Self::BinaryData(v) => binary_len(v),
            Self::Utf8String(v) => string_len(v),
            Self::Utf8StringPair(k, v) => string_len(k) + string_len(v),
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Byte(v) => buf.put_u8(*v),
            Self::TwoByteInteger(v) => buf.put_u16(*v),
            Self::FourByteInteger(v) => buf.put_u32(*v),
            Self::VariableByteInteger(v) => encode_variable_int(buf, *v)?,
            Self::BinaryData(v) => encode_binary(buf, v)?,
            Self::Utf8String(v) => encode_string(buf, v)?,
            Self::Utf8StringPair(k, v) => {
                encode_string(buf, k)?;
                encode_string(buf, v)?;
            }
        }
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B, value_type: PropertyValueType) -> Result<Self> {
        let need = match value_type {
            PropertyValueType::Byte => 1,
            PropertyValueType::TwoByteInteger => 2,
            PropertyValueType::FourByteInteger => 4,
            _ => 0,
        };
        if buf.remaining() < need {
            return Err(MqttError::MalformedPacket(format!(
                "Insufficient data for {value_type:?} property"
            )));
        }

        let value = match value_type {
            PropertyValueType::Byte => Self::Byte(buf.get_u8()),
            PropertyValueType::TwoByteInteger => Self::TwoByteInteger(buf.get_u16()),
            PropertyValueType::FourByteInteger => Self::FourByteInteger(buf.get_u32()),
            PropertyValueType::VariableByteInteger => {
                Self::VariableByteInteger(decode_variable_int(buf)?)
            }
            PropertyValueType::BinaryData => Self::BinaryData(decode_binary(buf)?),
            PropertyValueType::Utf8String => Self::Utf8String(decode_string(buf)?),
            PropertyValueType::Utf8StringPair => {
                let key = decode_string(buf)?;
                let value = decode_string(buf)?;
                Self::Utf8StringPair(key, value)
            }
        };
        Ok(value)
    }
}

/// Container for MQTT v5.0 properties
///
/// Values are kept per identifier in identifier order, which is also the
/// order they are written in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    properties: BTreeMap<PropertyId, Vec<PropertyValue>>,
}

impl Properties {
    /// Creates a new empty properties container
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property value
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the value type doesn't match the
    /// property, or if a single-instance property is already present
    pub fn add(&mut self, id: PropertyId, value: PropertyValue) -> Result<()> {
        if value.value_type() != id.value_type() {
            return Err(MqttError::MalformedPacket(format!(
                "Property {id:?} expects {:?}, got {:?}",
                id.value_type(),
                value.value_type()
            )));
        }
        if !id.allows_multiple() && self.properties.contains_key(&id) {
            return Err(MqttError::MalformedPacket(format!(
                "Duplicate property 0x{:02X}",
                id as u8
            )));
        }
        self.properties.entry(id).or_default().push(value);
        Ok(())
    }

    /// Replaces any existing values of a single-instance property.
    fn set(&mut self, id: PropertyId, value: PropertyValue) {
        debug_assert_eq!(value.value_type(), id.value_type());
        self.properties.insert(id, vec![value]);
    }

    /// Gets the first value for a property
    #[must_use]
    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.properties.get(&id).and_then(|v| v.first())
    }

    /// Gets all values for a property
    #[must_use]
    pub fn get_all(&self, id: PropertyId) -> Option<&[PropertyValue]> {
        self.properties.get(&id).map(Vec::as_slice)
    }

    /// Checks if a property exists
    #[must_use]
    pub fn contains(&self, id: PropertyId) -> bool {
        self.properties.contains_key(&id)
    }

    /// Checks if the container is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Iterates over every property value, grouped by identifier
    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &PropertyValue)> + '_ {
        self.properties
            .iter()
            .flat_map(|(id, values)| values.iter().map(move |value| (*id, value)))
    }

    fn body_len(&self) -> usize {
        self.iter()
            .map(|(id, value)| variable_int_len(u32::from(id as u8)) + value.encoded_len())
            .sum()
    }

    /// Encoded length including the variable byte integer length prefix
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let len = self.body_len();
        variable_int_len(u32::try_from(len).unwrap_or(u32::MAX)) + len
    }

    /// Writes the property length followed by every property
    ///
    /// # Errors
    ///
    /// Returns an error if a string or binary value is too long
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let len = self.body_len();
        let len = u32::try_from(len).map_err(|_| MqttError::PacketTooLarge {
            size: len,
            max: crate::encoding::VARIABLE_INT_MAX as usize,
        })?;
        encode_variable_int(buf, len)?;

        for (id, value) in self.iter() {
            encode_variable_int(buf, u32::from(id as u8))?;
            value.encode(buf)?;
        }
        Ok(())
    }

    /// Reads a property block
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the block is truncated, names an unknown
    /// identifier, or repeats a single-instance property
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let len = decode_variable_int(buf)? as usize;
        if buf.remaining() < len {
            return Err(MqttError::MalformedPacket(format!(
                "Properties declare {len} bytes but only {} remain",
                buf.remaining()
            )));
        }

        let mut block = buf.copy_to_bytes(len);
        let mut properties = Self::new();

        while block.has_remaining() {
            let raw = decode_variable_int(&mut block)?;
            let id = u8::try_from(raw)
                .ok()
                .and_then(PropertyId::from_u8)
                .ok_or_else(|| {
                    MqttError::MalformedPacket(format!("Unknown property identifier 0x{raw:02X}"))
                })?;
            let value = PropertyValue::decode(&mut block, id.value_type())?;
            properties.add(id, value)?;
        }

        Ok(properties)
    }

    fn get_u32(&self, id: PropertyId) -> Option<u32> {
        match self.get(id)? {
            PropertyValue::FourByteInteger(v) | PropertyValue::VariableByteInteger(v) => Some(*v),
            _ => None,
        }
    }

    fn get_u16(&self, id: PropertyId) -> Option<u16> {
        match self.get(id)? {
            PropertyValue::TwoByteInteger(v) => Some(*v),
            _ => None,
        }
    }

    fn get_str(&self, id: PropertyId) -> Option<&str> {
        match self.get(id)? {
            PropertyValue::Utf8String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Sets the session expiry interval
    pub fn set_session_expiry_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::SessionExpiryInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    /// Gets the session expiry interval
    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        self.get_u32(PropertyId::SessionExpiryInterval)
    }

    /// Sets the receive maximum
    pub fn set_receive_maximum(&mut self, value: u16) {
        self.set(PropertyId::ReceiveMaximum, PropertyValue::TwoByteInteger(value));
    }

    /// Gets the receive maximum
    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        self.get_u16(PropertyId::ReceiveMaximum)
    }

    /// Sets the maximum packet size
    pub fn set_maximum_packet_size(&mut self, value: u32) {
        self.set(
            PropertyId::MaximumPacketSize,
            PropertyValue::FourByteInteger(value),
        );
    }

    /// Gets the maximum packet size
    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.get_u32(PropertyId::MaximumPacketSize)
    }

    /// Sets the server keep alive
    pub fn set_server_keep_alive(&mut self, seconds: u16) {
        self.set(PropertyId::ServerKeepAlive, PropertyValue::TwoByteInteger(seconds));
    }

    /// Gets the server keep alive
    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        self.get_u16(PropertyId::ServerKeepAlive)
    }

    /// Sets the assigned client identifier
    pub fn set_assigned_client_identifier(&mut self, id: String) {
        self.set(PropertyId::AssignedClientIdentifier, PropertyValue::Utf8String(id));
    }

    /// Gets the assigned client identifier
    #[must_use]
    pub fn assigned_client_identifier(&self) -> Option<&str> {
        self.get_str(PropertyId::AssignedClientIdentifier)
    }

    /// Sets the reason string
    pub fn set_reason_string(&mut self, reason: String) {
        self.set(PropertyId::ReasonString, PropertyValue::Utf8String(reason));
    }

    /// Gets the reason string
    #[must_use]
    pub fn reason_string(&self) -> Option<&str> {
        self.get_str(PropertyId::ReasonString)
    }

    /// Sets the message expiry interval
    pub fn set_message_expiry_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::MessageExpiryInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    /// Sets the will delay interval
    pub fn set_will_delay_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::WillDelayInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    /// Sets the content type
    pub fn set_content_type(&mut self, content_type: String) {
        self.set(PropertyId::ContentType, PropertyValue::Utf8String(content_type));
    }

    /// Sets the response topic
    pub fn set_response_topic(&mut self, topic: String) {
        self.set(PropertyId::ResponseTopic, PropertyValue::Utf8String(topic));
    }

    /// Sets the correlation data
    pub fn set_correlation_data(&mut self, data: Bytes) {
        self.set(PropertyId::CorrelationData, PropertyValue::BinaryData(data));
    }

    /// Adds a user property; names may repeat
    pub fn add_user_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties
            .entry(PropertyId::UserProperty)
            .or_default()
            .push(PropertyValue::Utf8StringPair(key.into(), value.into()));
    }

    /// Iterates over the user properties
    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.get_all(PropertyId::UserProperty)
            .unwrap_or_default()
            .iter()
            .filter_map(|value| match value {
                PropertyValue::Utf8StringPair(k, v) => Some((k.as_str(), v.as_str())),
                _ => None,
            })
    }

    /// Adds a subscription identifier
    pub fn add_subscription_identifier(&mut self, id: u32) {
        self.properties
            .entry(PropertyId::SubscriptionIdentifier)
            .or_default()
            .push(PropertyValue::VariableByteInteger(id));
    }
}
