//! MQTT Client - Direct Async Implementation
//!
//! Every operation validates its arguments, hands the packet to the
//! connection's writer and returns a [`Token`] right away. Await
//! [`Token::wait`] (or block on [`Token::wait_blocking`]) for the outcome.

use crate::callback::{MessageListener, MqttCallback};
use crate::error::{MqttError, Result};
use crate::packet::{PublishPacket, TopicFilter};
use crate::persistence::MqttPersistence;
use crate::token::Token;
use crate::transport::Transport;
use crate::types::{ConnectOptions, ConnectionStats};
use crate::QoS;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub(crate) mod comms;
mod connection;
mod error_recovery;

pub use self::connection::{ConnectionState, ReconnectConfig};
pub use self::error_recovery::{backoff_delay, is_recoverable, RecoverableError, RetryState};

use self::comms::{ClientComms, DisconnectStart};

/// How long a graceful disconnect waits for the DISCONNECT to be written
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thread-safe MQTT 3.1.1 / 5.0 client
///
/// Cloning is cheap and every clone drives the same connection. Operations
/// need a Tokio runtime since they spawn the connection tasks.
///
/// # Examples
///
/// ```rust,no_run
/// use mqtt_comms::transport::MockTransport;
/// use mqtt_comms::{ConnectOptions, MemoryPersistence, MqttClient, QoS};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> mqtt_comms::Result<()> {
/// let (transport, _listener) = MockTransport::new();
/// let client = MqttClient::new(
///     "device-001",
///     Arc::new(transport),
///     Arc::new(MemoryPersistence::new()),
/// )?;
///
/// let options = ConnectOptions::new("device-001")
///     .with_clean_start(false)
///     .with_keep_alive(Duration::from_secs(30));
/// let connected = client.connect(options)?;
/// connected.wait().await?;
/// println!("session present: {}", connected.session_present());
///
/// let delivery = client.publish("status/device-001", &b"online"[..], QoS::AtLeastOnce, true)?;
/// delivery.wait_for(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqttClient {
    comms: Arc<ClientComms>,
}

impl MqttClient {
    /// Creates a client over `transport`, keeping in-flight messages in
    /// `persistence`
    ///
    /// Unacknowledged publishes a previous instance left in `persistence`
    /// show up in [`pending_delivery_tokens`](Self::pending_delivery_tokens)
    /// and are resumed on the first connect with `clean_start == false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence cannot be opened or read
    pub fn new(
        client_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn MqttPersistence>,
    ) -> Result<Self> {
        let client_id = client_id.into();
        tracing::trace!(client_id = %client_id, "Creating MQTT client");
        let comms = ClientComms::new(&client_id, transport, persistence)?;
        Ok(Self {
            comms: Arc::new(comms),
        })
    }

    /// Gets the client identifier
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.comms.state().client_id()
    }

    /// Gets the server the transport connects to
    #[must_use]
    pub fn server_uri(&self) -> String {
        self.comms.server_uri()
    }

    /// Starts connecting with `options`
    ///
    /// The token completes once the CONNACK arrives; its
    /// [`session_present`](Token::session_present) tells whether the server
    /// kept the session.
    ///
    /// # Errors
    ///
    /// `AlreadyConnected`, `ConnectionClosed`, or `InvalidState` while
    /// another connect or disconnect is in progress
    #[instrument(skip(self, options), fields(client_id = %options.client_id, clean_start = %options.clean_start), level = "debug")]
    pub fn connect(&self, options: ConnectOptions) -> Result<Token> {
        if options.client_id != self.client_id() {
            return Err(MqttError::InvalidArgument(format!(
                "options are for client '{}', not '{}'",
                options.client_id,
                self.client_id()
            )));
        }
        let token = self.comms.begin_connect(&options)?;
        tracing::info!(server = %self.server_uri(), "Initiating MQTT connection");
        let comms = self.comms.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let _ = comms.run_connect(options, task_token, false).await;
        });
        Ok(token)
    }

    /// Connects again with the options of the last connect
    ///
    /// # Errors
    ///
    /// `InvalidState` if never connected or not disconnected
    #[instrument(skip(self), level = "debug")]
    pub fn reconnect(&self) -> Result<Token> {
        let (options, token) = self.comms.begin_reconnect()?;
        let comms = self.comms.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let _ = comms.run_connect(options, task_token, true).await;
        });
        Ok(token)
    }

    /// Graceful disconnect
    ///
    /// New operations are refused at once; outstanding ones get up to
    /// `quiesce_timeout` to finish before DISCONNECT is sent. The
    /// connection-lost callback is not called.
    ///
    /// While an automatic reconnect is pending, disconnecting stops it
    /// (an attempt in progress fails with `Quiesced`) and the returned
    /// token is already complete.
    ///
    /// # Errors
    ///
    /// `NotConnected`, `Quiesced` if already disconnecting, or
    /// `ConnectionClosed`
    #[instrument(skip(self), level = "debug")]
    pub fn disconnect(&self, quiesce_timeout: Duration) -> Result<Token> {
        let (generation, token) = match self.comms.begin_disconnect()? {
            DisconnectStart::Quiescing { generation, token } => (generation, token),
            DisconnectStart::Cancelled(token) => return Ok(token),
        };
        let comms = self.comms.clone();
        let task_token = token.clone();
        tokio::spawn(comms.run_disconnect(
            generation,
            task_token,
            quiesce_timeout,
            DEFAULT_DISCONNECT_TIMEOUT,
        ));
        Ok(token)
    }

    /// Disconnects and waits until the connection is down
    ///
    /// Waits up to `quiesce_timeout` for outstanding work and up to
    /// `disconnect_timeout` for the DISCONNECT write; after that the
    /// connection is dropped regardless.
    ///
    /// # Errors
    ///
    /// As [`disconnect`](Self::disconnect)
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect_forcibly(
        &self,
        quiesce_timeout: Duration,
        disconnect_timeout: Duration,
    ) -> Result<()> {
        let DisconnectStart::Quiescing { generation, token } = self.comms.begin_disconnect()? else {
            return Ok(());
        };
        self.comms
            .clone()
            .run_disconnect(generation, token, quiesce_timeout, disconnect_timeout)
            .await;
        Ok(())
    }

    /// Publishes `payload` to `topic`
    ///
    /// `QoS` 0 completes once written. `QoS` 1/2 messages are persisted
    /// before sending and complete on PUBACK/PUBCOMP.
    ///
    /// # Errors
    ///
    /// `InvalidTopicName`, `NotConnected`, `IdentifiersExhausted`,
    /// `PacketTooLarge`, `FlowControlExceeded` when the server's receive
    /// maximum of unacknowledged `QoS` 1/2 publishes is reached, or a
    /// persistence failure. Nothing is sent then.
    #[instrument(skip(self, payload), level = "debug")]
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Result<Token> {
        let publish = PublishPacket::new(topic, payload, qos).with_retain(retained);
        self.comms.publish(publish)
    }

    /// Publishes a prepared message, v5 properties included
    ///
    /// Any packet identifier on `publish` is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// As [`publish`](Self::publish)
    #[instrument(skip(self, publish), fields(topic = %publish.topic_name, qos = ?publish.qos), level = "debug")]
    pub fn publish_message(&self, publish: PublishPacket) -> Result<Token> {
        self.comms.publish(publish)
    }

    /// Subscribes to `filters`, `qos[i]` being the maximum for `filters[i]`
    ///
    /// # Errors
    ///
    /// `InvalidTopicFilter`, `InvalidArgument` on mismatched lengths,
    /// `NotConnected` or `IdentifiersExhausted`
    #[instrument(skip(self), level = "debug")]
    pub fn subscribe(&self, filters: &[&str], qos: &[QoS]) -> Result<Token> {
        self.subscribe_with_listeners(filters, qos, Vec::new())
    }

    /// Subscribes with a listener per filter
    ///
    /// Messages matching a listener's filter go to that listener instead of
    /// [`MqttCallback::message_arrived`]. `listeners` is either empty or as
    /// long as `filters`. Listeners of filters the server refuses are
    /// removed when the SUBACK arrives.
    ///
    /// # Errors
    ///
    /// As [`subscribe`](Self::subscribe)
    #[instrument(skip(self, listeners), level = "debug")]
    pub fn subscribe_with_listeners(
        &self,
        filters: &[&str],
        qos: &[QoS],
        listeners: Vec<Option<MessageListener>>,
    ) -> Result<Token> {
        if filters.len() != qos.len() {
            return Err(MqttError::InvalidArgument(format!(
                "{} filters but {} QoS values",
                filters.len(),
                qos.len()
            )));
        }
        let filters = filters
            .iter()
            .zip(qos)
            .map(|(filter, qos)| TopicFilter::new(*filter, *qos))
            .collect();
        self.comms.subscribe(filters, listeners)
    }

    /// Subscribes with full v5 subscription options
    ///
    /// # Errors
    ///
    /// As [`subscribe_with_listeners`](Self::subscribe_with_listeners)
    #[instrument(skip(self, filters, listeners), level = "debug")]
    pub fn subscribe_filters(
        &self,
        filters: Vec<TopicFilter>,
        listeners: Vec<Option<MessageListener>>,
    ) -> Result<Token> {
        self.comms.subscribe(filters, listeners)
    }

    /// Unsubscribes from `filters` and drops their listeners
    ///
    /// # Errors
    ///
    /// `InvalidTopicFilter`, `NotConnected` or `IdentifiersExhausted`
    #[instrument(skip(self), level = "debug")]
    pub fn unsubscribe(&self, filters: &[&str]) -> Result<Token> {
        self.comms.unsubscribe(filters)
    }

    /// Releases the client for good
    ///
    /// Without `force` the client must be disconnected first. With `force`
    /// a live connection is dropped on the spot. Every outstanding token
    /// fails with `ConnectionClosed`; persisted messages stay in the
    /// persistence for a later client.
    ///
    /// # Errors
    ///
    /// `InvalidState` when connected and not forced, or a persistence
    /// failure on close
    #[instrument(skip(self), level = "debug")]
    pub fn close(&self, force: bool) -> Result<()> {
        self.comms.close(force)
    }

    /// Whether the client is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.comms.connection_state().is_connected()
    }

    /// Gets the connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.comms.connection_state()
    }

    /// Replaces the client-wide callback
    pub fn set_callback(&self, callback: Arc<dyn MqttCallback>) {
        self.comms.set_callback(callback);
    }

    /// Outstanding `QoS` 1/2 publish tokens, restored ones included
    #[must_use]
    pub fn pending_delivery_tokens(&self) -> Vec<Token> {
        self.comms.pending_delivery_tokens()
    }

    /// Number of operations awaiting completion
    #[must_use]
    pub fn outstanding_operations(&self) -> usize {
        self.comms.tokens().count()
    }

    /// Snapshot of the traffic counters
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.comms.state().stats()
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("comms", &self.comms)
            .finish()
    }
}
