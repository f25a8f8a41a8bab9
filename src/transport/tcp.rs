use crate::error::{MqttError, Result};
use crate::transport::{BoxedReader, BoxedWriter, Transport};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// OS level keepalive, independent of the MQTT keep-alive
    pub keepalive: Option<Duration>,
}

impl TcpConfig {
    /// Creates a new TCP configuration
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
        }
    }

    /// Sets the connection timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables `TCP_NODELAY`
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Sets the socket keep-alive idle time; `None` turns it off
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// TCP transport to an MQTT server
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Creates a TCP transport with default settings
    #[must_use]
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(TcpConfig::new(addr))
    }

    /// Gets the configuration
    #[must_use]
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)> {
        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| MqttError::Timeout)??;

        stream.set_nodelay(self.config.nodelay)?;

        if let Some(keepalive_duration) = self.config.keepalive {
            let sock_ref = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
            sock_ref.set_tcp_keepalive(&keepalive)?;
        }

        debug!(addr = %self.config.addr, "TCP connection established");
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn server_uri(&self) -> String {
        format!("tcp://{}", self.config.addr)
    }
}
