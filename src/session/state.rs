use crate::error::Result;
use crate::packet::ConnAckPacket;
use crate::packet_id::PacketIdAllocator;
use crate::session::keepalive::{KeepAliveAction, KeepAliveTracker};
use crate::session::limits::PacketSizeLimits;
use crate::types::{ConnectOptions, ConnectionStats};
use crate::ProtocolVersion;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Per-client session state shared by the caller side and the network tasks
///
/// Everything sits behind one mutex that is only ever held for bookkeeping,
/// never across an await or a network call.
#[derive(Debug)]
pub struct ClientState {
    client_id: String,
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    version: ProtocolVersion,
    clean_start: bool,
    packet_ids: PacketIdAllocator,
    keep_alive: KeepAliveTracker,
    limits: PacketSizeLimits,
    server_receive_maximum: Option<u16>,
    stats: ConnectionStats,
}

impl ClientState {
    /// Creates the state for `client_id`, before any connect
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            inner: Mutex::new(StateInner {
                version: ProtocolVersion::V5,
                clean_start: true,
                packet_ids: PacketIdAllocator::new(),
                keep_alive: KeepAliveTracker::new(Duration::ZERO),
                limits: PacketSizeLimits::default(),
                server_receive_maximum: None,
                stats: ConnectionStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the client identifier
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Takes the connection parameters for the next CONNECT
    pub fn configure(&self, options: &ConnectOptions) {
        let mut inner = self.lock();
        inner.version = options.protocol_version;
        inner.clean_start = options.clean_start;
        inner.limits = PacketSizeLimits::new(options.maximum_packet_size);
        inner.keep_alive.reset(options.keep_alive);
        inner.server_receive_maximum = None;
    }

    /// Applies the limits and keep-alive the server returned in CONNACK
    pub fn apply_connack(&self, connack: &ConnAckPacket) {
        let mut inner = self.lock();
        inner.limits.set_server_maximum(connack.maximum_packet_size());
        inner.server_receive_maximum = connack.receive_maximum();
        let interval = match connack.server_keep_alive() {
            Some(seconds) => {
                debug!(seconds, "Server assigned keep alive");
                Duration::from_secs(u64::from(seconds))
            }
            None => inner.keep_alive.interval(),
        };
        inner.keep_alive.reset(interval);
    }

    /// Protocol version of the current or last connection
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.lock().version
    }

    /// Whether the current connection started a clean session
    #[must_use]
    pub fn clean_start(&self) -> bool {
        self.lock().clean_start
    }

    /// # Errors
    ///
    /// `IdentifiersExhausted` when every identifier is in use
    pub fn next_packet_id(&self) -> Result<u16> {
        self.lock().packet_ids.next()
    }

    /// Frees `id` for reuse. Returns true if it was in use.
    pub fn release_packet_id(&self, id: u16) -> bool {
        self.lock().packet_ids.release(id)
    }

    /// Marks `id` as taken, for records restored from persistence
    pub fn reserve_packet_id(&self, id: u16) {
        self.lock().packet_ids.reserve(id);
    }

    /// Checks whether `id` is taken
    #[must_use]
    pub fn packet_id_in_use(&self, id: u16) -> bool {
        self.lock().packet_ids.is_in_use(id)
    }

    /// Frees every packet identifier
    pub fn clear_packet_ids(&self) {
        self.lock().packet_ids.clear();
    }

    /// Records `n` bytes written and refreshes the keep-alive
    pub fn note_bytes_sent(&self, n: usize) {
        let mut inner = self.lock();
        inner.stats.bytes_sent += n as u64;
        inner.keep_alive.note_sent(Instant::now());
    }

    /// Records `n` bytes read and refreshes the keep-alive
    pub fn note_bytes_received(&self, n: usize) {
        let mut inner = self.lock();
        inner.stats.bytes_received += n as u64;
        inner.keep_alive.note_received(Instant::now());
    }

    /// Counts one packet written
    pub fn note_packet_sent(&self) {
        self.lock().stats.messages_sent += 1;
    }

    /// Counts one packet read
    pub fn note_packet_received(&self) {
        self.lock().stats.messages_received += 1;
    }

    /// Records that a PINGREQ went out
    pub fn note_ping_sent(&self) {
        self.lock().keep_alive.note_ping_sent(Instant::now());
    }

    /// What the keep-alive task should do at `now`
    #[must_use]
    pub fn keep_alive_check(&self, now: Instant) -> KeepAliveAction {
        self.lock().keep_alive.check(now)
    }

    /// Keep-alive interval in force, after any server override
    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        self.lock().keep_alive.interval()
    }

    /// # Errors
    ///
    /// `PacketTooLarge` if the server would not accept `size` bytes
    pub fn check_outgoing_size(&self, size: usize) -> Result<()> {
        self.lock().limits.check_outgoing(size)
    }

    /// # Errors
    ///
    /// `IncomingPacketTooLarge` if `size` is above the advertised maximum
    pub fn check_incoming_size(&self, size: usize) -> Result<()> {
        self.lock().limits.check_incoming(size)
    }

    /// Current packet size limits in both directions
    #[must_use]
    pub fn limits(&self) -> PacketSizeLimits {
        self.lock().limits
    }

    /// Receive maximum from the last CONNACK, if the server sent one
    #[must_use]
    pub fn server_receive_maximum(&self) -> Option<u16> {
        self.lock().server_receive_maximum
    }

    /// Snapshot of the traffic counters
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats
    }
}
