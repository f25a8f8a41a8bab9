use crate::client::ReconnectConfig;
use crate::constants::limits::WRITE_CHUNK_SIZE;
use crate::packet::PublishPacket;
use crate::protocol::v5::properties::Properties;
use crate::QoS;
use bytes::Bytes;
use std::time::Duration;

pub use crate::protocol::v5::reason_codes::ReasonCode;

/// Protocol level carried in CONNECT and used for every packet on the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1, protocol level 4
    V311 = 4,
    /// MQTT 5.0, protocol level 5
    #[default]
    V5 = 5,
}

impl ProtocolVersion {
    #[must_use]
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            4 => Some(Self::V311),
            5 => Some(Self::V5),
            _ => None,
        }
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        version as u8
    }
}

/// Last Will and Testament
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Will properties, dropped on 3.1.1 connections
    pub properties: Properties,
}

impl WillMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Connection options for [`MqttClient::connect`](crate::MqttClient::connect)
///
/// # Examples
///
/// ```
/// use mqtt_comms::{ConnectOptions, ProtocolVersion, WillMessage, QoS};
/// use std::time::Duration;
///
/// let will = WillMessage::new("status/sensor-1", &b"offline"[..])
///     .with_qos(QoS::AtLeastOnce)
///     .with_retain(true);
///
/// let options = ConnectOptions::new("sensor-1")
///     .with_protocol_version(ProtocolVersion::V311)
///     .with_clean_start(false)
///     .with_keep_alive(Duration::from_secs(30))
///     .with_will(will)
///     .with_automatic_reconnect(true);
///
/// assert_eq!(options.keep_alive, Duration::from_secs(30));
/// assert!(options.reconnect.enabled);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    /// Zero disables keep-alive
    pub keep_alive: Duration,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<WillMessage>,
    /// Bounds both the transport connect and the wait for CONNACK
    pub connection_timeout: Duration,
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    /// Largest packet this client accepts; advertised to the server on v5.0
    pub maximum_packet_size: Option<u32>,
    pub reconnect: ReconnectConfig,
    /// How long the reader blocks before yielding without a packet
    pub read_timeout: Duration,
    pub write_chunk_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            protocol_version: ProtocolVersion::V5,
            keep_alive: Duration::from_secs(60),
            clean_start: true,
            username: None,
            password: None,
            will: None,
            connection_timeout: Duration::from_secs(30),
            session_expiry_interval: None,
            receive_maximum: None,
            maximum_packet_size: None,
            reconnect: ReconnectConfig::default(),
            read_timeout: Duration::from_secs(1),
            write_chunk_size: WRITE_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = duration;
        self
    }

    #[must_use]
    pub fn with_clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Bytes>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, interval: u32) -> Self {
        self.session_expiry_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_receive_maximum(mut self, receive_maximum: u16) -> Self {
        self.receive_maximum = Some(receive_maximum);
        self
    }

    #[must_use]
    pub fn with_maximum_packet_size(mut self, size: u32) -> Self {
        self.maximum_packet_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_automatic_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect.initial_delay = initial;
        self.reconnect.max_delay = max;
        self
    }

    #[must_use]
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = size.max(1);
        self
    }
}

/// Application message handed to listeners and `message_arrived`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Set when the server flagged a possible redelivery
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: Properties,
}

impl From<PublishPacket> for Message {
    fn from(packet: PublishPacket) -> Self {
        Self {
            topic: packet.topic_name,
            payload: packet.payload,
            qos: packet.qos,
            retain: packet.retain,
            dup: packet.dup,
            packet_id: packet.packet_id,
            properties: packet.properties,
        }
    }
}

/// Traffic counters for the current client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}
