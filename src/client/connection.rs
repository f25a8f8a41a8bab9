use crate::error::MqttError;
use std::time::Duration;

/// Client connection state machine
///
/// `Disconnected -> Connecting -> Connected -> Quiescing -> Disconnecting ->
/// Disconnected`. A lost connection goes from `Connected` straight back to
/// `Disconnected` (or `Connecting` when reconnect is enabled). `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Rejecting new operations while in-flight handshakes drain
    Quiescing,
    Disconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether the state is `Connected`
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Operations other than connect are refused in this state
    #[must_use]
    pub fn refusal(self) -> Option<MqttError> {
        match self {
            Self::Connected => None,
            Self::Quiescing | Self::Disconnecting => Some(MqttError::Quiesced),
            Self::Closed => Some(MqttError::ConnectionClosed),
            Self::Disconnected | Self::Connecting => Some(MqttError::NotConnected),
        }
    }
}

/// Automatic reconnect policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(128),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Default policy with automatic reconnect turned on
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(128));
        assert!((config.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, None);
        assert!(ReconnectConfig::enabled().enabled);
    }

    #[test]
    fn test_refusal_per_state() {
        assert_eq!(ConnectionState::Connected.refusal(), None);
        assert_eq!(
            ConnectionState::Quiescing.refusal(),
            Some(MqttError::Quiesced)
        );
        assert_eq!(
            ConnectionState::Closed.refusal(),
            Some(MqttError::ConnectionClosed)
        );
        assert_eq!(
            ConnectionState::Connecting.refusal(),
            Some(MqttError::NotConnected)
        );
    }
}
