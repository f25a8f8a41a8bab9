use crate::packet::PacketType;

/// MQTT v5.0 reason codes
///
/// Values below 0x80 indicate success, everything from 0x80 up is a failure.
/// The same numeric value can carry different names depending on the packet
/// (0x00 is Success, Normal disconnection and Granted QoS 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    Success = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    DisconnectWithWillMessage = 0x04,
    NoMatchingSubscribers = 0x10,
    NoSubscriptionExisted = 0x11,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,

    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    UnsupportedProtocolVersion = 0x84,
    ClientIdentifierNotValid = 0x85,
    BadUsernameOrPassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    Banned = 0x8A,
    ServerShuttingDown = 0x8B,
    BadAuthenticationMethod = 0x8C,
    KeepAliveTimeout = 0x8D,
    SessionTakenOver = 0x8E,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    PacketIdentifierInUse = 0x91,
    PacketIdentifierNotFound = 0x92,
    ReceiveMaximumExceeded = 0x93,
    TopicAliasInvalid = 0x94,
    PacketTooLarge = 0x95,
    MessageRateTooHigh = 0x96,
    QuotaExceeded = 0x97,
    AdministrativeAction = 0x98,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    SharedSubscriptionsNotSupported = 0x9E,
    ConnectionRateExceeded = 0x9F,
    MaximumConnectTime = 0xA0,
    SubscriptionIdentifiersNotSupported = 0xA1,
    WildcardSubscriptionsNotSupported = 0xA2,
}

/// DISCONNECT reason for a normal disconnect
pub const NORMAL_DISCONNECTION: ReasonCode = ReasonCode::Success;
/// SUBACK reason granting `QoS` 0
pub const GRANTED_QOS_0: ReasonCode = ReasonCode::Success;

const PUBACK_PUBREC_CODES: &[u8] = &[0x00, 0x10, 0x80, 0x83, 0x87, 0x90, 0x91, 0x97, 0x99];
const PUBREL_PUBCOMP_CODES: &[u8] = &[0x00, 0x92];
const SUBACK_CODES: &[u8] = &[
    0x00, 0x01, 0x02, 0x80, 0x83, 0x87, 0x8F, 0x91, 0x97, 0x9E, 0xA1, 0xA2,
];
const UNSUBACK_CODES: &[u8] = &[0x00, 0x11, 0x80, 0x83, 0x87, 0x8F, 0x91];
const AUTH_CODES: &[u8] = &[0x00, 0x18, 0x19];
const CONNACK_CODES: &[u8] = &[
    0x00, 0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0x8C, 0x90, 0x95,
    0x97, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9F,
];

impl From<ReasonCode> for u8 {
    fn from(code: ReasonCode) -> Self {
        code as u8
    }
}

impl ReasonCode {
    /// Checks if this is a success code (< 0x80)
    #[must_use]
    pub fn is_success(&self) -> bool {
        u8::from(*self) < 0x80
    }

    /// Checks if this is an error code (>= 0x80)
    #[must_use]
    pub fn is_error(&self) -> bool {
        u8::from(*self) >= 0x80
    }

    /// Converts a u8 to a reason code
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        let code = match value {
            0x00 => Self::Success,
            0x01 => Self::GrantedQoS1,
            0x02 => Self::GrantedQoS2,
            0x04 => Self::DisconnectWithWillMessage,
            0x10 => Self::NoMatchingSubscribers,
            0x11 => Self::NoSubscriptionExisted,
            0x18 => Self::ContinueAuthentication,
            0x19 => Self::ReAuthenticate,
            0x80 => Self::UnspecifiedError,
            0x81 => Self::MalformedPacket,
            0x82 => Self::ProtocolError,
            0x83 => Self::ImplementationSpecificError,
            0x84 => Self::UnsupportedProtocolVersion,
            0x85 => Self::ClientIdentifierNotValid,
            0x86 => Self::BadUsernameOrPassword,
            0x87 => Self::NotAuthorized,
            0x88 => Self::ServerUnavailable,
            0x89 => Self::ServerBusy,
            0x8A => Self::Banned,
            0x8B => Self::ServerShuttingDown,
            0x8C => Self::BadAuthenticationMethod,
            0x8D => Self::KeepAliveTimeout,
            0x8E => Self::SessionTakenOver,
            0x8F => Self::TopicFilterInvalid,
            0x90 => Self::TopicNameInvalid,
            0x91 => Self::PacketIdentifierInUse,
            0x92 => Self::PacketIdentifierNotFound,
            0x93 => Self::ReceiveMaximumExceeded,
            0x94 => Self::TopicAliasInvalid,
            0x95 => Self::PacketTooLarge,
            0x96 => Self::MessageRateTooHigh,
            0x97 => Self::QuotaExceeded,
            0x98 => Self::AdministrativeAction,
            0x99 => Self::PayloadFormatInvalid,
            0x9A => Self::RetainNotSupported,
            0x9B => Self::QoSNotSupported,
            0x9C => Self::UseAnotherServer,
            0x9D => Self::ServerMoved,
            0x9E => Self::SharedSubscriptionsNotSupported,
            0x9F => Self::ConnectionRateExceeded,
            0xA0 => Self::MaximumConnectTime,
            0xA1 => Self::SubscriptionIdentifiersNotSupported,
            0xA2 => Self::WildcardSubscriptionsNotSupported,
            _ => return None,
        };
        Some(code)
    }

    /// Returns true if this code may appear in a packet of the given type.
    ///
    /// DISCONNECT accepts every defined code except the SUBACK grants and
    /// the authentication continuations.
    #[must_use]
    pub fn is_valid_for(&self, packet_type: PacketType) -> bool {
        let value = u8::from(*self);
        match packet_type {
            PacketType::ConnAck => CONNACK_CODES.contains(&value),
            PacketType::PubAck | PacketType::PubRec => PUBACK_PUBREC_CODES.contains(&value),
            PacketType::PubRel | PacketType::PubComp => PUBREL_PUBCOMP_CODES.contains(&value),
            PacketType::SubAck => SUBACK_CODES.contains(&value),
            PacketType::UnsubAck => UNSUBACK_CODES.contains(&value),
            PacketType::Auth => AUTH_CODES.contains(&value),
            PacketType::Disconnect => !matches!(value, 0x01 | 0x02 | 0x11 | 0x18 | 0x19),
            _ => false,
        }
    }

    /// Decodes a reason code byte and checks it against the packet type.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` for unknown codes or codes that are not
    /// permitted in `packet_type`
    pub fn decode_for(value: u8, packet_type: PacketType) -> crate::Result<Self> {
        Self::from_u8(value)
            .filter(|code| code.is_valid_for(packet_type))
            .ok_or_else(|| {
                crate::MqttError::MalformedPacket(format!(
                    "Invalid reason code 0x{value:02X} for {packet_type:?}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_success_check() {
        assert!(ReasonCode::Success.is_success());
        assert!(ReasonCode::GrantedQoS2.is_success());
        assert!(ReasonCode::NoMatchingSubscribers.is_success());

        assert!(!ReasonCode::UnspecifiedError.is_success());
        assert!(ReasonCode::NotAuthorized.is_error());
        assert!(ReasonCode::ServerBusy.is_error());
    }

    #[test]
    fn test_reason_code_from_u8() {
        assert_eq!(ReasonCode::from_u8(0x00), Some(ReasonCode::Success));
        assert_eq!(ReasonCode::from_u8(0x92), Some(ReasonCode::PacketIdentifierNotFound));
        assert_eq!(
            ReasonCode::from_u8(0xA2),
            Some(ReasonCode::WildcardSubscriptionsNotSupported)
        );

        assert_eq!(ReasonCode::from_u8(0x03), None);
        assert_eq!(ReasonCode::from_u8(0xFF), None);
    }

    #[test]
    fn test_aliases() {
        assert_eq!(NORMAL_DISCONNECTION as u8, 0x00);
        assert_eq!(GRANTED_QOS_0 as u8, 0x00);
    }

    #[test]
    fn test_validity_per_packet_type() {
        assert!(ReasonCode::NoMatchingSubscribers.is_valid_for(PacketType::PubAck));
        assert!(!ReasonCode::NoMatchingSubscribers.is_valid_for(PacketType::PubComp));
        assert!(ReasonCode::PacketIdentifierNotFound.is_valid_for(PacketType::PubRel));
        assert!(ReasonCode::GrantedQoS1.is_valid_for(PacketType::SubAck));
        assert!(!ReasonCode::GrantedQoS1.is_valid_for(PacketType::UnsubAck));
        assert!(ReasonCode::NoSubscriptionExisted.is_valid_for(PacketType::UnsubAck));
        assert!(ReasonCode::SessionTakenOver.is_valid_for(PacketType::Disconnect));
        assert!(!ReasonCode::ContinueAuthentication.is_valid_for(PacketType::Disconnect));
    }

    #[test]
    fn test_decode_for_rejects_wrong_packet() {
        assert_eq!(
            ReasonCode::decode_for(0x00, PacketType::PubComp).unwrap(),
            ReasonCode::Success
        );
        assert!(ReasonCode::decode_for(0x10, PacketType::PubComp).is_err());
        assert!(ReasonCode::decode_for(0x03, PacketType::PubAck).is_err());
    }
}
