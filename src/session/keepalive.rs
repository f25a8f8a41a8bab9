use std::time::Duration;
use tokio::time::Instant;

/// What the keep-alive task should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Nothing due; check again after this long
    Wait(Duration),
    SendPing,
    /// Nothing received for 1.5 times the interval
    Lost,
    /// Keep-alive is zero
    Disabled,
}

/// Tracks traffic in both directions to decide when PINGREQ is due
///
/// A ping is due once the outbound side has been idle for three quarters of
/// the interval, so it always leaves before the full interval elapses. An
/// inbound side silent for the whole interval also triggers one. The
/// connection is lost once nothing at all has arrived for 1.5 intervals.
#[derive(Debug, Clone)]
pub struct KeepAliveTracker {
    interval: Duration,
    last_sent: Instant,
    last_received: Instant,
    ping_outstanding: bool,
}

impl KeepAliveTracker {
    /// Starts tracking with both directions fresh
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            last_sent: now,
            last_received: now,
            ping_outstanding: false,
        }
    }

    /// Gets the keep-alive interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Restarts tracking, for a new connection or a server-assigned interval
    pub fn reset(&mut self, interval: Duration) {
        *self = Self::new(interval);
    }

    /// Records outbound traffic
    pub fn note_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Records inbound traffic, which also answers an outstanding ping
    pub fn note_received(&mut self, now: Instant) {
        self.last_received = now;
        self.ping_outstanding = false;
    }

    /// Records that a PINGREQ went out
    pub fn note_ping_sent(&mut self, now: Instant) {
        self.ping_outstanding = true;
        self.last_sent = now;
    }

    /// Whether a PINGREQ is waiting for any inbound traffic
    #[must_use]
    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    /// Decides what is due at `now`
    #[must_use]
    pub fn check(&self, now: Instant) -> KeepAliveAction {
        if self.interval.is_zero() {
            return KeepAliveAction::Disabled;
        }

        let lost_after = self.interval * 3 / 2;
        let ping_after = self.interval * 3 / 4;
        let since_received = now.saturating_duration_since(self.last_received);
        let since_sent = now.saturating_duration_since(self.last_sent);

        if since_received >= lost_after {
            return KeepAliveAction::Lost;
        }
        if !self.ping_outstanding && (since_sent >= ping_after || since_received >= self.interval)
        {
            return KeepAliveAction::SendPing;
        }

        let until_lost = lost_after - since_received;
        let wait = if self.ping_outstanding {
            until_lost
        } else {
            let until_ping = (ping_after - since_sent).min(
                self.interval
                    .checked_sub(since_received)
                    .unwrap_or(Duration::ZERO),
            );
            until_ping.min(until_lost)
        };
        KeepAliveAction::Wait(wait.max(Duration::from_millis(1)))
    }
}
