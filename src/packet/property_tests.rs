use crate::packet::{
    FixedHeader, Packet, PubAckPacket, PubRelPacket, PublishPacket, SubscribePacket,
};
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::{ProtocolVersion, QoS};
use bytes::BytesMut;
use proptest::prelude::*;

fn topic_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9/]{1,40}").unwrap()
}

fn qos_strategy() -> impl Strategy<Value = QoS> {
    prop_oneof![
        Just(QoS::AtMostOnce),
        Just(QoS::AtLeastOnce),
        Just(QoS::ExactlyOnce),
    ]
}

fn version_strategy() -> impl Strategy<Value = ProtocolVersion> {
    prop_oneof![Just(ProtocolVersion::V311), Just(ProtocolVersion::V5)]
}

fn decode_all(buf: &mut BytesMut, version: ProtocolVersion) -> crate::Result<Packet> {
    let header = FixedHeader::decode(buf)?;
    Packet::decode_from_body(&header, buf, version)
}

proptest! {
    #[test]
    fn publish_survives_encoding(
        topic in topic_name_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
        qos in qos_strategy(),
        packet_id in 1u16..,
        retain in any::<bool>(),
        version in version_strategy(),
    ) {
        let mut packet = PublishPacket::new(topic, payload, qos)
            .with_packet_id(packet_id)
            .with_retain(retain);
        if version == ProtocolVersion::V5 {
            packet = packet.with_message_expiry_interval(30);
        }

        let mut buf = BytesMut::new();
        Packet::Publish(packet.clone()).encode(&mut buf, version).unwrap();
        let header = FixedHeader::decode(&mut buf.clone()).unwrap();
        prop_assert_eq!(header.packet_len(), buf.len());
        prop_assert_eq!(decode_all(&mut buf, version).unwrap(), Packet::Publish(packet));
    }

    #[test]
    fn truncated_publish_never_decodes(
        topic in topic_name_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..64),
        qos in qos_strategy(),
        cut in 1usize..8,
        version in version_strategy(),
    ) {
        let packet = PublishPacket::new(topic, payload, qos).with_packet_id(7);
        let mut buf = BytesMut::new();
        Packet::Publish(packet).encode(&mut buf, version).unwrap();
        let mut header_buf = buf.clone();
        let header = FixedHeader::decode(&mut header_buf).unwrap();
        let cut = cut.min(header_buf.len());
        let mut short = header_buf.split_to(header_buf.len() - cut);
        prop_assert!(Packet::decode_from_body(&header, &mut short, version).is_err());
    }

    #[test]
    fn acks_carry_their_id(
        packet_id in 1u16..,
        failed in any::<bool>(),
        version in version_strategy(),
    ) {
        let ack = if failed && version == ProtocolVersion::V5 {
            PubAckPacket::with_reason(packet_id, ReasonCode::QuotaExceeded)
        } else {
            PubAckPacket::new(packet_id)
        };
        let mut buf = BytesMut::new();
        Packet::PubAck(ack.clone()).encode(&mut buf, version).unwrap();
        let decoded = decode_all(&mut buf, version).unwrap();
        prop_assert_eq!(decoded.packet_id(), Some(packet_id));
        prop_assert_eq!(decoded, Packet::PubAck(ack));

        let mut buf = BytesMut::new();
        Packet::PubRel(PubRelPacket::new(packet_id)).encode(&mut buf, version).unwrap();
        prop_assert_eq!(buf[0], 0x62);
    }

    #[test]
    fn subscribe_filters_keep_order(
        filters in prop::collection::vec((topic_name_strategy(), qos_strategy()), 1..8),
        packet_id in 1u16..,
        version in version_strategy(),
    ) {
        let packet = filters
            .iter()
            .fold(SubscribePacket::new(packet_id), |p, (f, q)| p.add_filter(f.clone(), *q));
        let mut buf = BytesMut::new();
        Packet::Subscribe(packet.clone()).encode(&mut buf, version).unwrap();
        prop_assert_eq!(decode_all(&mut buf, version).unwrap(), Packet::Subscribe(packet));
    }

    #[test]
    fn random_bytes_never_panic(
        bytes in prop::collection::vec(any::<u8>(), 0..64),
        version in version_strategy(),
    ) {
        let mut buf = BytesMut::from(&bytes[..]);
        if let Ok(header) = FixedHeader::decode(&mut buf) {
            if buf.len() == header.remaining_length as usize {
                let _ = Packet::decode_from_body(&header, &mut buf, version);
            }
        }
    }
}
