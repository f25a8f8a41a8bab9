//! # MQTT 3.1.1 / 5.0 Client Engine
//!
//! The core of an MQTT client: the wire codec, the session and in-flight
//! message state, the token store that hands completion back to callers, and
//! the comms dispatcher that drives the `QoS` 1/2 handshakes over a single
//! byte stream.
//!
//! ## NO EVENT LOOPS
//!
//! Everything here is direct async/await. A connection runs a handful of
//! background tasks (packet reader, packet writer, keep-alive, reconnect)
//! and application calls talk to them through shared, mutex-guarded state.
//! There is no central event loop, command channel or actor.
//!
//! Application calls never wait for the network. They validate, enqueue and
//! return a [`Token`] which completes when the operation does.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqtt_comms::transport::{TcpConfig, TcpTransport};
//! use mqtt_comms::{ConnectOptions, MemoryPersistence, Message, MessageListener, MqttClient, QoS};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TcpTransport::new(TcpConfig::new("127.0.0.1:1883".parse()?));
//!     let client = MqttClient::new(
//!         "sensor-1",
//!         Arc::new(transport),
//!         Arc::new(MemoryPersistence::new()),
//!     )?;
//!
//!     client.connect(ConnectOptions::new("sensor-1"))?.wait().await?;
//!
//!     let listener: MessageListener = Arc::new(|msg: &Message| println!("{}", msg.topic));
//!     client
//!         .subscribe_with_listeners(&["sensors/+/temp"], &[QoS::AtLeastOnce], vec![Some(listener)])?
//!         .wait()
//!         .await?;
//!
//!     client
//!         .publish("sensors/kitchen/temp", &b"21.5"[..], QoS::ExactlyOnce, false)?
//!         .wait()
//!         .await?;
//!
//!     client.disconnect(Duration::from_secs(5))?.wait().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod callback;
pub mod client;
pub mod codec;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod network;
pub mod packet;
pub mod packet_id;
pub mod persistence;
pub mod protocol;
pub mod session;
mod tasks;
pub mod token;
pub mod topic_matching;
pub mod transport;
pub mod types;

pub use callback::{MessageListener, MqttCallback};
pub use client::{ConnectionState, MqttClient, ReconnectConfig};
pub use codec::PacketCodec;
pub use error::{MqttError, Result};
pub use packet::{FixedHeader, Packet, PacketType, PublishPacket};
pub use persistence::{MemoryPersistence, MqttPersistence};
pub use protocol::v5::properties::{Properties, PropertyId, PropertyValue};
pub use protocol::v5::reason_codes::ReasonCode;
pub use token::{Token, TokenStore};
pub use topic_matching::{is_valid_topic_filter, is_valid_topic_name, matches};
pub use types::{ConnectOptions, ConnectionStats, Message, ProtocolVersion, WillMessage};

/// Delivery guarantee of a PUBLISH or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::MalformedPacket(format!(
                "Invalid QoS value {other}"
            ))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_values() {
        assert_eq!(u8::from(QoS::AtMostOnce), 0);
        assert_eq!(u8::from(QoS::AtLeastOnce), 1);
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
    }

    #[test]
    fn test_qos_try_from() {
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert!(matches!(QoS::try_from(3), Err(MqttError::MalformedPacket(_))));
    }
}
