use crate::client::connection::ReconnectConfig;
use crate::error::MqttError;
use crate::types::ReasonCode;
use std::time::Duration;

/// Failures a reconnect attempt may recover from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableError {
    /// Transport closed, reset or timed out
    NetworkError,
    KeepAliveTimeout,
    /// Server refused the CONNECT for a transient reason
    ServerUnavailable,
    ServerBusy,
    ServerShuttingDown,
    QuotaExceeded,
}

impl RecoverableError {
    /// Classifies `error`; protocol and size violations are never recoverable
    #[must_use]
    pub fn classify(error: &MqttError) -> Option<Self> {
        match error {
            MqttError::KeepAliveTimeout => Some(Self::KeepAliveTimeout),
            MqttError::ConnectionRefused(reason) => match reason {
                ReasonCode::ServerUnavailable => Some(Self::ServerUnavailable),
                ReasonCode::ServerBusy => Some(Self::ServerBusy),
                ReasonCode::ServerShuttingDown => Some(Self::ServerShuttingDown),
                ReasonCode::QuotaExceeded | ReasonCode::ConnectionRateExceeded => {
                    Some(Self::QuotaExceeded)
                }
                _ => None,
            },
            MqttError::ServerDisconnected(ReasonCode::ServerShuttingDown) => {
                Some(Self::ServerShuttingDown)
            }
            e if e.is_connection_loss() => Some(Self::NetworkError),
            _ => None,
        }
    }
}

/// Whether a reconnect should be tried after `error`
#[must_use]
pub fn is_recoverable(error: &MqttError) -> bool {
    RecoverableError::classify(error).is_some()
}

/// Delay before reconnect attempt `attempt` (0-based), growing by
/// `backoff_factor` and capped at `max_delay`
#[must_use]
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let factor = config
        .backoff_factor
        .max(1.0)
        .powi(attempt.try_into().unwrap_or(i32::MAX));
    let delay = config.initial_delay.as_secs_f64() * factor;
    if !delay.is_finite() || delay >= config.max_delay.as_secs_f64() {
        config.max_delay
    } else {
        Duration::from_secs_f64(delay)
    }
}

/// Attempt bookkeeping for one reconnect sequence
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<MqttError>,
}

impl RetryState {
    /// Creates a fresh retry state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failed attempt
    pub fn record_attempt(&mut self, error: MqttError) {
        self.attempts += 1;
        self.last_error = Some(error);
    }

    /// Whether `config` allows another attempt
    #[must_use]
    pub fn should_retry(&self, config: &ReconnectConfig) -> bool {
        config.enabled && config.max_attempts.map_or(true, |max| self.attempts < max)
    }

    /// Delay before the next attempt
    #[must_use]
    pub fn next_delay(&self, config: &ReconnectConfig) -> Duration {
        backoff_delay(config, self.attempts)
    }

    /// Clears the attempt count after a success
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_error_classification() {
        assert_eq!(
            RecoverableError::classify(&MqttError::ConnectionLost("eof".into())),
            Some(RecoverableError::NetworkError)
        );
        assert_eq!(
            RecoverableError::classify(&MqttError::ConnectionRefused(ReasonCode::ServerBusy)),
            Some(RecoverableError::ServerBusy)
        );
        assert!(is_recoverable(&MqttError::KeepAliveTimeout));
        assert!(!is_recoverable(&MqttError::ProtocolError("bad".into())));
        assert!(!is_recoverable(&MqttError::MalformedPacket("bad".into())));
        assert!(!is_recoverable(&MqttError::IncomingPacketTooLarge { size: 10, max: 5 }));
        assert!(!is_recoverable(&MqttError::ConnectionRefused(
            ReasonCode::NotAuthorized
        )));
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let config = ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_attempts: None,
        };

        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_state_respects_max_attempts() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::enabled()
        };
        let mut state = RetryState::new();
        assert!(state.should_retry(&config));
        state.record_attempt(MqttError::Timeout);
        assert!(state.should_retry(&config));
        state.record_attempt(MqttError::Timeout);
        assert!(!state.should_retry(&config));
        assert_eq!(state.next_delay(&config), Duration::from_secs(4));

        state.reset();
        assert_eq!(state.attempts, 0);
        assert!(!state.should_retry(&ReconnectConfig::default()));
    }
}
