use crate::codec::{decode_packet, encode_packet};
use crate::error::{MqttError, Result};
use crate::packet::{Packet, PubRelPacket, PublishPacket};
use crate::persistence::MqttPersistence;
use crate::ProtocolVersion;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const OUTBOUND_PREFIX: &str = "s-";
const PUBREL_PREFIX: &str = "sc-";
const INBOUND_PREFIX: &str = "r-";

/// Handshake step an in-flight `QoS` 1/2 message had reached when persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InflightRecord {
    /// Outbound PUBLISH waiting for PUBACK (`QoS` 1) or PUBREC (`QoS` 2).
    /// Resent with DUP set.
    AwaitingAck(PublishPacket),
    /// Outbound `QoS` 2 past PUBREC. Only the PUBREL is resent; the original
    /// publish is kept for the delivery token when it is still stored.
    AwaitingPubComp {
        pubrel: PubRelPacket,
        publish: Option<PublishPacket>,
    },
    /// Inbound `QoS` 2 PUBLISH acknowledged with PUBREC, not yet released
    AwaitingRelease(PublishPacket),
}

impl InflightRecord {
    /// Packet identifier the record is stored under
    #[must_use]
    pub fn packet_id(&self) -> u16 {
        match self {
            Self::AwaitingAck(publish) | Self::AwaitingRelease(publish) => {
                publish.packet_id.unwrap_or_default()
            }
            Self::AwaitingPubComp { pubrel, .. } => pubrel.packet_id,
        }
    }
}

/// In-flight message records on top of a [`MqttPersistence`]
///
/// Values are the encoded packets, keyed `s-<id>` for outbound publishes,
/// `sc-<id>` for outbound PUBRELs and `r-<id>` for inbound `QoS` 2 publishes.
#[derive(Clone)]
pub struct InflightStore {
    persistence: Arc<dyn MqttPersistence>,
    version: ProtocolVersion,
}

impl std::fmt::Debug for InflightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightStore")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn key(prefix: &str, packet_id: u16) -> String {
    format!("{prefix}{packet_id}")
}

impl InflightStore {
    /// Creates a store encoding records with `version`
    #[must_use]
    pub fn new(persistence: Arc<dyn MqttPersistence>, version: ProtocolVersion) -> Self {
        Self {
            persistence,
            version,
        }
    }

    /// Gets the underlying persistence
    #[must_use]
    pub fn persistence(&self) -> &Arc<dyn MqttPersistence> {
        &self.persistence
    }

    fn put(&self, key: &str, packet: &Packet) -> Result<()> {
        let bytes = encode_packet(packet, self.version)?;
        self.persistence.put(key, bytes.freeze())
    }

    /// # Errors
    ///
    /// Returns an error if the publish has no packet id or the write fails
    pub fn persist_outbound(&self, publish: &PublishPacket) -> Result<()> {
        let id = publish.packet_id.ok_or_else(|| {
            MqttError::InvalidArgument("only QoS 1/2 publishes are persisted".to_string())
        })?;
        self.put(&key(OUTBOUND_PREFIX, id), &Packet::Publish(publish.clone()))
    }

    /// # Errors
    ///
    /// Returns an error if the write fails
    pub fn persist_pubrel(&self, pubrel: &PubRelPacket) -> Result<()> {
        self.put(&key(PUBREL_PREFIX, pubrel.packet_id), &Packet::PubRel(pubrel.clone()))
    }

    /// # Errors
    ///
    /// Returns an error if the publish has no packet id or the write fails
    pub fn persist_inbound(&self, publish: &PublishPacket) -> Result<()> {
        let id = publish.packet_id.ok_or_else(|| {
            MqttError::InvalidArgument("only QoS 2 publishes are persisted".to_string())
        })?;
        self.put(&key(INBOUND_PREFIX, id), &Packet::Publish(publish.clone()))
    }

    /// Removes both outbound records of a finished handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub fn remove_outbound(&self, packet_id: u16) -> Result<()> {
        self.persistence.remove(&key(PUBREL_PREFIX, packet_id))?;
        self.persistence.remove(&key(OUTBOUND_PREFIX, packet_id))
    }

    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub fn remove_inbound(&self, packet_id: u16) -> Result<()> {
        self.persistence.remove(&key(INBOUND_PREFIX, packet_id))
    }

    /// # Errors
    ///
    /// Returns an error if the read fails
    pub fn has_inbound(&self, packet_id: u16) -> Result<bool> {
        self.persistence.contains_key(&key(INBOUND_PREFIX, packet_id))
    }

    /// # Errors
    ///
    /// Returns an error if the read fails or the stored bytes do not decode
    pub fn inbound(&self, packet_id: u16) -> Result<Option<PublishPacket>> {
        match self.persistence.get(&key(INBOUND_PREFIX, packet_id))? {
            Some(bytes) => match decode_packet(&bytes, self.version)? {
                Packet::Publish(publish) => Ok(Some(publish)),
                other => Err(MqttError::Persistence(format!(
                    "expected PUBLISH under r-{packet_id}, found {:?}",
                    other.packet_type()
                ))),
            },
            None => Ok(None),
        }
    }

    /// Drops every record, used when a clean session starts
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be cleared
    pub fn clear(&self) -> Result<()> {
        self.persistence.clear()
    }

    /// Reads back every record: outbound handshakes in the order they were
    /// first sent, then inbound ones by packet id
    ///
    /// Unreadable entries are logged, removed and skipped so one corrupt
    /// record cannot block the session from resuming.
    ///
    /// # Errors
    ///
    /// Returns an error if the keys cannot be listed
    pub fn restore(&self) -> Result<Vec<InflightRecord>> {
        let mut outbound: BTreeMap<u16, PublishPacket> = BTreeMap::new();
        let mut pubrels: BTreeMap<u16, PubRelPacket> = BTreeMap::new();
        let mut inbound: BTreeMap<u16, PublishPacket> = BTreeMap::new();

        for stored_key in self.persistence.keys()? {
            let Some(bytes) = self.persistence.get(&stored_key)? else {
                continue;
            };
            match (stored_key.as_str(), decode_packet(&bytes, self.version)) {
                (k, Ok(Packet::PubRel(pubrel))) if k.starts_with(PUBREL_PREFIX) => {
                    pubrels.insert(pubrel.packet_id, pubrel);
                }
                (k, Ok(Packet::Publish(publish))) if k.starts_with(OUTBOUND_PREFIX) => {
                    if let Some(id) = publish.packet_id {
                        outbound.insert(id, publish);
                    }
                }
                (k, Ok(Packet::Publish(publish))) if k.starts_with(INBOUND_PREFIX) => {
                    if let Some(id) = publish.packet_id {
                        inbound.insert(id, publish);
                    }
                }
                (k, result) => {
                    warn!(key = k, ?result, "Discarding unreadable persisted record");
                    self.persistence.remove(k)?;
                }
            }
        }

        let mut records = Vec::with_capacity(outbound.len() + pubrels.len() + inbound.len());
        for (id, pubrel) in pubrels {
            records.push(InflightRecord::AwaitingPubComp {
                pubrel,
                publish: outbound.remove(&id),
            });
        }
        records.extend(outbound.into_values().map(InflightRecord::AwaitingAck));
        let mut records = in_send_order(records);
        records.extend(inbound.into_values().map(InflightRecord::AwaitingRelease));

        debug!(count = records.len(), "Restored in-flight records");
        Ok(records)
    }
}

/// Puts outbound records back in send order
///
/// Identifiers are handed out round-robin and wrap from 65535 to 1, so the
/// oldest record sits right after the widest gap between the identifiers
/// in use. Without a wrap that gap is the one spanning 65535.
fn in_send_order(mut records: Vec<InflightRecord>) -> Vec<InflightRecord> {
    records.sort_by_key(InflightRecord::packet_id);
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return records;
    };
    let mut widest =
        u32::from(u16::MAX) - u32::from(last.packet_id()) + u32::from(first.packet_id());
    let mut start = 0;
    for (i, pair) in records.windows(2).enumerate() {
        let gap = u32::from(pair[1].packet_id() - pair[0].packet_id());
        if gap > widest {
            widest = gap;
            start = i + 1;
        }
    }
    records.rotate_left(start);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::QoS;
    use bytes::Bytes;

    fn store() -> InflightStore {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence.open("inflight-test").unwrap();
        InflightStore::new(persistence, ProtocolVersion::V5)
    }

    fn publish(id: u16, qos: QoS) -> PublishPacket {
        PublishPacket::new("t", &b"data"[..], qos).with_packet_id(id)
    }

    #[test]
    fn test_restore_orders_and_classifies() {
        let store = store();
        store.persist_outbound(&publish(3, QoS::AtLeastOnce)).unwrap();
        store.persist_outbound(&publish(1, QoS::ExactlyOnce)).unwrap();
        store.persist_pubrel(&PubRelPacket::new(1)).unwrap();
        store.persist_inbound(&publish(2, QoS::ExactlyOnce)).unwrap();

        let records = store.restore().unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(
            &records[0],
            InflightRecord::AwaitingPubComp { pubrel, publish: Some(_) } if pubrel.packet_id == 1
        ));
        assert!(matches!(&records[1], InflightRecord::AwaitingAck(p) if p.packet_id == Some(3)));
        assert!(matches!(&records[2], InflightRecord::AwaitingRelease(p) if p.packet_id == Some(2)));
    }

    #[test]
    fn test_restore_keeps_send_order_across_id_wrap() {
        let store = store();
        // Sent as 65533, 65535, then 1 and 2 after the counter wrapped
        store.persist_outbound(&publish(65533, QoS::AtLeastOnce)).unwrap();
        store.persist_outbound(&publish(65535, QoS::ExactlyOnce)).unwrap();
        store.persist_pubrel(&PubRelPacket::new(65535)).unwrap();
        store.persist_outbound(&publish(1, QoS::AtLeastOnce)).unwrap();
        store.persist_outbound(&publish(2, QoS::ExactlyOnce)).unwrap();
        store.persist_inbound(&publish(40, QoS::ExactlyOnce)).unwrap();

        let ids: Vec<u16> = store
            .restore()
            .unwrap()
            .iter()
            .map(InflightRecord::packet_id)
            .collect();
        assert_eq!(ids, vec![65533, 65535, 1, 2, 40]);
    }

    #[test]
    fn test_restore_without_wrap_is_id_order() {
        let store = store();
        for id in [9, 4, 300] {
            store.persist_outbound(&publish(id, QoS::AtLeastOnce)).unwrap();
        }
        let ids: Vec<u16> = store
            .restore()
            .unwrap()
            .iter()
            .map(InflightRecord::packet_id)
            .collect();
        assert_eq!(ids, vec![4, 9, 300]);
    }

    #[test]
    fn test_remove_outbound_clears_both_records() {
        let store = store();
        store.persist_outbound(&publish(7, QoS::ExactlyOnce)).unwrap();
        store.persist_pubrel(&PubRelPacket::new(7)).unwrap();
        store.remove_outbound(7).unwrap();
        assert!(store.restore().unwrap().is_empty());
    }

    #[test]
    fn test_inbound_lookup() {
        let store = store();
        assert!(!store.has_inbound(4).unwrap());
        store.persist_inbound(&publish(4, QoS::ExactlyOnce)).unwrap();
        assert!(store.has_inbound(4).unwrap());
        assert_eq!(store.inbound(4).unwrap().unwrap().payload, Bytes::from_static(b"data"));
        store.remove_inbound(4).unwrap();
        assert_eq!(store.inbound(4).unwrap(), None);
    }

    #[test]
    fn test_corrupt_record_is_dropped() {
        let store = store();
        store
            .persistence()
            .put("s-9", Bytes::from_static(&[0x30, 0x05, 0x00]))
            .unwrap();
        assert!(store.restore().unwrap().is_empty());
        assert!(!store.persistence().contains_key("s-9").unwrap());
    }

    #[test]
    fn test_qos0_is_not_persisted() {
        let store = store();
        assert!(store
            .persist_outbound(&PublishPacket::new("t", Bytes::new(), QoS::AtMostOnce))
            .is_err());
    }
}
