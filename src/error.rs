use crate::protocol::v5::reason_codes::ReasonCode;
use thiserror::Error;

/// Result type for MQTT operations
pub type Result<T> = std::result::Result<T, MqttError>;

/// MQTT client engine errors
///
/// One cause is frequently attached to many tokens at once (every outstanding
/// operation fails with the same `ConnectionLost`), so the type is `Clone`.
///
/// # Error Categories
///
/// - **Fatal protocol/size**: `MalformedPacket`, `ProtocolError`, `IncomingPacketTooLarge`.
///   The connection is terminated and never retried as is.
/// - **Connection loss**: `ConnectionLost`, `KeepAliveTimeout`, `Io`, `ServerDisconnected`.
///   Eligible for automatic reconnect.
/// - **Local rejection**: `IdentifiersExhausted`, `PacketTooLarge`, `FlowControlExceeded`,
///   `Quiesced`, `ConnectionClosed`, `NotConnected`, invalid topics and arguments.
/// - **Client-side wait**: `Timeout`. The operation itself may still complete.
///
/// # Examples
///
/// ```
/// use mqtt_comms::{MqttError, Result};
///
/// fn check_size(size: usize, max: usize) -> Result<()> {
///     if size > max {
///         return Err(MqttError::PacketTooLarge { size, max });
///     }
///     Ok(())
/// }
///
/// assert!(check_size(10, 5).is_err());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Incoming packet too large: size {size} exceeds maximum {max}")]
    IncomingPacketTooLarge { size: usize, max: usize },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Server sent DISCONNECT: {0:?}")]
    ServerDisconnected(ReasonCode),

    #[error("Connection refused: {0:?}")]
    ConnectionRefused(ReasonCode),

    #[error("No packet identifiers available")]
    IdentifiersExhausted,

    /// The server's receive maximum is reached; retry once a delivery completes
    #[error("Flow control exceeded: receive maximum {0} reached")]
    FlowControlExceeded(u16),

    #[error("Timeout")]
    Timeout,

    #[error("Client is quiescing")]
    Quiesced,

    #[error("Client is closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Publish failed: {0:?}")]
    PublishFailed(ReasonCode),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl MqttError {
    /// Protocol or size violations. The connection that produced one of these
    /// is terminated and the same exchange is never retried on it.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MqttError::MalformedPacket(_)
                | MqttError::ProtocolError(_)
                | MqttError::IncomingPacketTooLarge { .. }
        )
    }

    /// Network-level losses which may be recovered by reconnecting.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            MqttError::ConnectionLost(_)
                | MqttError::KeepAliveTimeout
                | MqttError::Io(_)
                | MqttError::ServerDisconnected(_)
                | MqttError::Timeout
        )
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => MqttError::ConnectionLost(err.to_string()),
            _ => MqttError::Io(err.to_string()),
        }
    }
}

impl From<bebytes::BeBytesError> for MqttError {
    fn from(err: bebytes::BeBytesError) -> Self {
        MqttError::MalformedPacket(format!("{err:?}"))
    }
}
