//! In-memory transport and scripted broker peer
//!
//! CRITICAL: NO EVENT LOOPS
//! Every `connect` creates a fresh in-memory duplex pipe and hands the server
//! end to the [`MockBrokerListener`]. Tests drive the broker side directly
//! with async calls.

use crate::codec::PacketCodec;
use crate::error::{MqttError, Result};
use crate::packet::{ConnAckPacket, ConnectPacket, Packet};
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::transport::{BoxedReader, BoxedWriter, Transport};
use crate::ProtocolVersion;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

/// In-memory transport whose connections are answered by a [`MockBroker`]
#[derive(Debug)]
pub struct MockTransport {
    connections: mpsc::UnboundedSender<DuplexStream>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

impl MockTransport {
    /// Creates the transport and the listener receiving its server ends
    #[must_use]
    pub fn new() -> (Self, MockBrokerListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: tx,
                refuse: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
            },
            MockBrokerListener { connections: rx },
        )
    }

    /// Makes following connection attempts fail like a closed port
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts so far, refused ones included
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(MqttError::Io("connection refused".into()));
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.connections
            .send(server)
            .map_err(|_| MqttError::Io("mock listener dropped".into()))?;
        let (reader, writer) = tokio::io::split(client);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn server_uri(&self) -> String {
        "mock://broker".to_string()
    }
}

/// Server side of a [`MockTransport`], accepting its connections
#[derive(Debug)]
pub struct MockBrokerListener {
    connections: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MockBrokerListener {
    /// Waits for the next client connection
    pub async fn accept(&mut self) -> Option<MockBroker> {
        self.connections.recv().await.map(MockBroker::new)
    }

    /// Like [`accept`](Self::accept), giving up after `wait`
    pub async fn accept_within(&mut self, wait: Duration) -> Option<MockBroker> {
        tokio::time::timeout(wait, self.accept()).await.ok().flatten()
    }
}

/// Server side of one mock connection
#[derive(Debug)]
pub struct MockBroker {
    stream: DuplexStream,
    buffer: BytesMut,
    codec: PacketCodec,
}

impl MockBroker {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(1024),
            codec: PacketCodec::new(ProtocolVersion::V5),
        }
    }

    /// Protocol version adopted from the last CONNECT
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.codec.version
    }

    /// Reads the next packet sent by the client
    ///
    /// # Errors
    ///
    /// `ConnectionLost` once the client closed its end, or a decode error
    pub async fn recv(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buffer)? {
                return Ok(packet);
            }
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(MqttError::ConnectionLost("client closed".into()));
            }
        }
    }

    /// Reads the next packet if one arrives within `wait`
    ///
    /// # Errors
    ///
    /// As [`recv`](Self::recv)
    pub async fn recv_within(&mut self, wait: Duration) -> Result<Option<Packet>> {
        match tokio::time::timeout(wait, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Reads a CONNECT, adopts its protocol version and answers with
    /// `reason_code`
    ///
    /// # Errors
    ///
    /// `ProtocolError` if the first packet is not a CONNECT
    pub async fn accept_connect_with(
        &mut self,
        session_present: bool,
        reason_code: ReasonCode,
    ) -> Result<ConnectPacket> {
        let connect = match self.recv().await? {
            Packet::Connect(connect) => *connect,
            other => {
                return Err(MqttError::ProtocolError(format!(
                    "expected CONNECT, got {:?}",
                    other.packet_type()
                )))
            }
        };
        self.codec = PacketCodec::new(connect.protocol_version);
        self.send(&Packet::ConnAck(ConnAckPacket::new(session_present, reason_code)))
            .await?;
        Ok(connect)
    }

    /// Accepts the CONNECT with a successful CONNACK
    ///
    /// # Errors
    ///
    /// As [`accept_connect_with`](Self::accept_connect_with)
    pub async fn accept_connect(&mut self, session_present: bool) -> Result<ConnectPacket> {
        self.accept_connect_with(session_present, ReasonCode::Success)
            .await
    }

    /// Reads the CONNECT without answering it
    ///
    /// # Errors
    ///
    /// `ProtocolError` if the first packet is not a CONNECT
    pub async fn read_connect(&mut self) -> Result<ConnectPacket> {
        match self.recv().await? {
            Packet::Connect(connect) => {
                self.codec = PacketCodec::new(connect.protocol_version);
                Ok(*connect)
            }
            other => Err(MqttError::ProtocolError(format!(
                "expected CONNECT, got {:?}",
                other.packet_type()
            ))),
        }
    }

    /// Sends `packet` encoded for the connection's protocol version
    ///
    /// # Errors
    ///
    /// Encoding or write failures
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let mut out = BytesMut::new();
        self.codec.encode(packet, &mut out)?;
        self.send_raw(&out).await
    }

    /// Writes raw bytes, for malformed input
    ///
    /// # Errors
    ///
    /// Write failures
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Drops the connection without a DISCONNECT
    pub fn drop_connection(self) {
        drop(self);
    }
}
