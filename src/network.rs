//! Packet-level reading and writing over a transport's byte halves
//!
//! The reader and writer each own one half of the stream; nothing else
//! touches the socket. Outbound packets reach the writer through the
//! [`OutboundQueue`], which keeps them in the order they were issued.

mod queue;
mod reader;
mod writer;

pub use queue::{Outbound, OutboundQueue};
pub use reader::NetworkReader;
pub use writer::NetworkWriter;
