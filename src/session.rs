//! Client session state: packet identifiers, keep-alive, size limits,
//! traffic counters and the persisted in-flight records

pub mod inflight;
pub mod keepalive;
pub mod limits;
pub mod state;

pub use inflight::{InflightRecord, InflightStore};
pub use keepalive::{KeepAliveAction, KeepAliveTracker};
pub use limits::PacketSizeLimits;
pub use state::ClientState;
