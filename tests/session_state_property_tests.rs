//! Property-based tests for client session state
//!
//! - Packet identifiers are unique while in use and never zero
//! - Persisted in-flight records come back in the state they were left in
//! - Records survive a persistence close/reopen under the same client id
//! - Outbound records come back in send order even after the ids wrap

use mqtt_comms::packet::PubRelPacket;
use mqtt_comms::packet_id::PacketIdAllocator;
use mqtt_comms::session::{InflightRecord, InflightStore};
use mqtt_comms::{MemoryPersistence, MqttPersistence, ProtocolVersion, PublishPacket, QoS};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Where an outbound handshake was left when the connection dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Published,
    Released,
    Completed,
}

fn qos_level() -> impl Strategy<Value = QoS> {
    prop_oneof![Just(QoS::AtLeastOnce), Just(QoS::ExactlyOnce)]
}

fn stage() -> impl Strategy<Value = Stage> {
    prop_oneof![
        Just(Stage::Published),
        Just(Stage::Released),
        Just(Stage::Completed),
    ]
}

fn open_store(client_id: &str) -> (Arc<MemoryPersistence>, InflightStore) {
    let persistence = Arc::new(MemoryPersistence::new());
    persistence.open(client_id).unwrap();
    let store = InflightStore::new(persistence.clone(), ProtocolVersion::V5);
    (persistence, store)
}

proptest! {
    #[test]
    fn prop_allocated_ids_unique_while_in_use(count in 1usize..500, releases in prop::collection::vec(any::<bool>(), 500)) {
        let mut allocator = PacketIdAllocator::new();
        let mut in_use = HashSet::new();
        for (i, release) in releases.iter().take(count).enumerate() {
            let id = allocator.next().unwrap();
            prop_assert_ne!(id, 0);
            prop_assert!(in_use.insert(id), "id {} handed out twice", id);
            if *release && i % 2 == 0 {
                prop_assert!(allocator.release(id));
                in_use.remove(&id);
            }
        }
        prop_assert_eq!(allocator.in_use_count(), in_use.len());
    }

    #[test]
    fn prop_reserved_ids_are_skipped(reserved in prop::collection::hash_set(1u16..64, 1..32)) {
        let mut allocator = PacketIdAllocator::new();
        for id in &reserved {
            allocator.reserve(*id);
        }
        for _ in 0..64 {
            let id = allocator.next().unwrap();
            prop_assert!(!reserved.contains(&id));
        }
    }

    #[test]
    fn prop_restore_reflects_handshake_stage(
        handshakes in prop::collection::btree_map(1u16..=u16::MAX, (qos_level(), stage()), 0..40)
    ) {
        let (_persistence, store) = open_store("prop-restore");
        let mut expected: BTreeMap<u16, Stage> = BTreeMap::new();

        for (id, (qos, stage)) in &handshakes {
            let publish = PublishPacket::new(format!("prop/{id}"), vec![0u8; 4], *qos)
                .with_packet_id(*id);
            store.persist_outbound(&publish).unwrap();
            match (qos, stage) {
                (_, Stage::Completed) => {
                    store.remove_outbound(*id).unwrap();
                }
                (QoS::ExactlyOnce, Stage::Released) => {
                    store.persist_pubrel(&PubRelPacket::new(*id)).unwrap();
                    expected.insert(*id, Stage::Released);
                }
                _ => {
                    expected.insert(*id, Stage::Published);
                }
            }
        }

        let restored = store.restore().unwrap();
        prop_assert_eq!(restored.len(), expected.len());
        let mut ids: Vec<u16> = restored.iter().map(InflightRecord::packet_id).collect();
        ids.sort_unstable();
        let expected_ids: Vec<u16> = expected.keys().copied().collect();
        prop_assert_eq!(ids, expected_ids);

        for record in restored {
            match record {
                InflightRecord::AwaitingAck(publish) => {
                    let id = publish.packet_id.unwrap();
                    prop_assert_eq!(expected[&id], Stage::Published);
                    prop_assert_eq!(publish.topic_name, format!("prop/{id}"));
                }
                InflightRecord::AwaitingPubComp { pubrel, publish } => {
                    prop_assert_eq!(expected[&pubrel.packet_id], Stage::Released);
                    prop_assert!(publish.is_some());
                }
                InflightRecord::AwaitingRelease(_) => {
                    prop_assert!(false, "no inbound records were written");
                }
            }
        }
    }

    #[test]
    fn prop_inbound_records_survive_reopen(ids in prop::collection::btree_set(1u16..=u16::MAX, 1..20)) {
        let (persistence, store) = open_store("prop-inbound");
        for id in &ids {
            let publish = PublishPacket::new("in/prop", vec![1u8], QoS::ExactlyOnce)
                .with_packet_id(*id);
            store.persist_inbound(&publish).unwrap();
        }
        persistence.close().unwrap();
        persistence.open("prop-inbound").unwrap();

        for id in &ids {
            prop_assert!(store.has_inbound(*id).unwrap());
        }
        let restored: Vec<u16> = store
            .restore()
            .unwrap()
            .iter()
            .filter(|record| matches!(record, InflightRecord::AwaitingRelease(_)))
            .map(InflightRecord::packet_id)
            .collect();
        prop_assert_eq!(restored, ids.iter().copied().collect::<Vec<_>>());
    }

    #[test]
    fn prop_restore_follows_send_order_across_wrap(start in 1u16..=u16::MAX, count in 1usize..30) {
        let (_persistence, store) = open_store("prop-wrap");
        let mut sent = Vec::with_capacity(count);
        for i in 0..count {
            // Round-robin over 1..=65535, as the allocator hands them out
            let id = u16::try_from((u32::from(start) - 1 + i as u32) % 65_535 + 1).unwrap();
            let publish = PublishPacket::new("prop/wrap", vec![0u8], QoS::AtLeastOnce)
                .with_packet_id(id);
            store.persist_outbound(&publish).unwrap();
            sent.push(id);
        }
        let restored: Vec<u16> = store
            .restore()
            .unwrap()
            .iter()
            .map(InflightRecord::packet_id)
            .collect();
        prop_assert_eq!(restored, sent);
    }
}
