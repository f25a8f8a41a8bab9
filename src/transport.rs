//! Byte stream transports
//!
//! A transport only knows how to open a fresh duplex stream to the server.
//! Framing, timeouts on reads and reconnect policy live above it, so each
//! connection attempt gets new halves and nothing is shared between
//! connections.

pub mod mock;
pub mod tcp;

use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use mock::{MockBroker, MockBrokerListener, MockTransport};
pub use tcp::{TcpConfig, TcpTransport};

/// Read half of a connected stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a connected stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection and returns its read and write halves
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established
    async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)>;

    /// Server description for logs
    fn server_uri(&self) -> String;
}
