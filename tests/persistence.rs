mod common;

use common::{test_client_id, TestHarness, DEFAULT_TIMEOUT};
use mqtt_comms::packet::{PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket};
use mqtt_comms::{MemoryPersistence, MqttError, MqttPersistence, Packet, PublishPacket, QoS};
use std::sync::Arc;
use std::time::Duration;

async fn expect_publish(broker: &mut mqtt_comms::transport::MockBroker) -> PublishPacket {
    match broker.recv().await.unwrap() {
        Packet::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unacked_qos1_resent_with_dup_after_reconnect() {
    let mut harness = TestHarness::new("resume-qos1");
    let options = harness.options().with_clean_start(false);
    let (mut broker, _) = harness.connect_with(options, false).await;

    let token = harness
        .client
        .publish("resume/qos1", &b"keep me"[..], QoS::AtLeastOnce, false)
        .unwrap();
    let first = expect_publish(&mut broker).await;
    assert!(!first.dup);

    broker.drop_connection();
    assert!(harness.events.wait_for_loss().await);
    assert!(!token.is_complete());
    assert_eq!(harness.client.pending_delivery_tokens().len(), 1);

    let reconnect = harness.client.reconnect().unwrap();
    let mut broker = harness.accept(true).await;
    reconnect.wait_for(DEFAULT_TIMEOUT).await.unwrap();
    assert!(reconnect.session_present());

    let resent = expect_publish(&mut broker).await;
    assert!(resent.dup);
    assert_eq!(resent.packet_id, first.packet_id);
    assert_eq!(resent.payload, first.payload);

    broker
        .send(&Packet::PubAck(PubAckPacket::new(first.packet_id.unwrap())))
        .await
        .unwrap();
    token.wait_for(DEFAULT_TIMEOUT).await.unwrap();
    assert!(harness.client.pending_delivery_tokens().is_empty());
    assert_eq!(harness.events.connects(), vec![false, true]);
}

#[tokio::test]
async fn test_pubrel_resent_instead_of_publish_after_pubrec() {
    let mut harness = TestHarness::new("resume-qos2");
    let options = harness.options().with_clean_start(false);
    let (mut broker, _) = harness.connect_with(options, false).await;

    let token = harness
        .client
        .publish("resume/qos2", &b"twice?"[..], QoS::ExactlyOnce, false)
        .unwrap();
    let id = expect_publish(&mut broker).await.packet_id.unwrap();
    broker
        .send(&Packet::PubRec(PubRecPacket::new(id)))
        .await
        .unwrap();
    assert!(matches!(broker.recv().await.unwrap(), Packet::PubRel(rel) if rel.packet_id == id));

    broker.drop_connection();
    assert!(harness.events.wait_for_loss().await);

    let reconnect = harness.client.reconnect().unwrap();
    let mut broker = harness.accept(true).await;
    reconnect.wait_for(DEFAULT_TIMEOUT).await.unwrap();

    match broker.recv().await.unwrap() {
        Packet::PubRel(rel) => assert_eq!(rel.packet_id, id),
        other => panic!("expected PUBREL, got {other:?}"),
    }
    broker
        .send(&Packet::PubComp(PubCompPacket::new(id)))
        .await
        .unwrap();
    token.wait_for(DEFAULT_TIMEOUT).await.unwrap();
    assert!(matches!(token.response(), Some(Packet::PubComp(_))));

    // Nothing else was pending
    assert!(broker
        .recv_within(Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_new_instance_restores_pending_deliveries() {
    let client_id = test_client_id("restart");
    let persistence = Arc::new(MemoryPersistence::new());

    let mut first = TestHarness::with_persistence(&client_id, persistence.clone());
    let options = first.options().with_clean_start(false);
    let (mut broker, _) = first.connect_with(options, false).await;
    first
        .client
        .publish("restart/a", &b"one"[..], QoS::AtLeastOnce, false)
        .unwrap();
    first
        .client
        .publish("restart/b", &b"two"[..], QoS::ExactlyOnce, false)
        .unwrap();
    let a = expect_publish(&mut broker).await;
    let b = expect_publish(&mut broker).await;
    first.client.close(true).unwrap();
    drop(broker);

    let mut second = TestHarness::with_persistence(&client_id, persistence);
    let pending = second.client.pending_delivery_tokens();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].message().unwrap().topic_name, "restart/a");
    assert_eq!(pending[1].message().unwrap().topic_name, "restart/b");

    let options = second.options().with_clean_start(false);
    let (mut broker, _) = second.connect_with(options, true).await;
    let resent_a = expect_publish(&mut broker).await;
    let resent_b = expect_publish(&mut broker).await;
    assert!(resent_a.dup && resent_b.dup);
    assert_eq!(resent_a.packet_id, a.packet_id);
    assert_eq!(resent_b.packet_id, b.packet_id);

    broker
        .send(&Packet::PubAck(PubAckPacket::new(a.packet_id.unwrap())))
        .await
        .unwrap();
    pending[0].wait_for(DEFAULT_TIMEOUT).await.unwrap();

    let id = b.packet_id.unwrap();
    broker
        .send(&Packet::PubRec(PubRecPacket::new(id)))
        .await
        .unwrap();
    assert!(matches!(broker.recv().await.unwrap(), Packet::PubRel(rel) if rel.packet_id == id));
    broker
        .send(&Packet::PubComp(PubCompPacket::new(id)))
        .await
        .unwrap();
    pending[1].wait_for(DEFAULT_TIMEOUT).await.unwrap();
    assert!(second.client.pending_delivery_tokens().is_empty());
}

#[tokio::test]
async fn test_clean_start_discards_persisted_session() {
    let client_id = test_client_id("clean");
    let persistence = Arc::new(MemoryPersistence::new());

    let mut first = TestHarness::with_persistence(&client_id, persistence.clone());
    let options = first.options().with_clean_start(false);
    let (mut broker, _) = first.connect_with(options, false).await;
    first
        .client
        .publish("clean/a", &b"stale"[..], QoS::AtLeastOnce, false)
        .unwrap();
    expect_publish(&mut broker).await;
    first.client.close(true).unwrap();

    let mut second = TestHarness::with_persistence(&client_id, persistence.clone());
    let pending = second.client.pending_delivery_tokens();
    assert_eq!(pending.len(), 1);

    let mut broker = second.connect().await;
    let err = pending[0].wait_for(DEFAULT_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, MqttError::InvalidState(_)));
    assert!(second.client.pending_delivery_tokens().is_empty());
    assert!(broker
        .recv_within(Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());

    assert!(persistence.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_inbound_qos2_survives_reconnect_until_released() {
    let mut harness = TestHarness::new("inbound-resume");
    let options = harness.options().with_clean_start(false);
    let (mut broker, _) = harness.connect_with(options, false).await;

    let publish = PublishPacket::new("in/held", &b"held"[..], QoS::ExactlyOnce).with_packet_id(42);
    broker.send(&Packet::Publish(publish)).await.unwrap();
    assert!(matches!(broker.recv().await.unwrap(), Packet::PubRec(_)));
    broker.drop_connection();
    assert!(harness.events.wait_for_loss().await);
    assert!(harness.events.messages().is_empty());

    let reconnect = harness.client.reconnect().unwrap();
    let mut broker = harness.accept(true).await;
    reconnect.wait_for(DEFAULT_TIMEOUT).await.unwrap();

    broker
        .send(&Packet::PubRel(PubRelPacket::new(42)))
        .await
        .unwrap();
    assert!(matches!(broker.recv().await.unwrap(), Packet::PubComp(comp) if comp.packet_id == 42));
    let messages = harness.events.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "in/held");
}

#[tokio::test]
async fn test_loss_with_clean_start_fails_deliveries() {
    let mut harness = TestHarness::new("clean-loss");
    let mut broker = harness.connect().await;

    let token = harness
        .client
        .publish("lost/qos1", &b"gone"[..], QoS::AtLeastOnce, false)
        .unwrap();
    expect_publish(&mut broker).await;
    broker.drop_connection();

    let err = token.wait_for(DEFAULT_TIMEOUT).await.unwrap_err();
    assert!(err.is_connection_loss());
    assert!(harness.client.pending_delivery_tokens().is_empty());
}
