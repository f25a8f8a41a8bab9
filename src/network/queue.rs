use crate::error::{MqttError, Result};
use crate::packet::Packet;
use crate::token::{Token, TokenKind};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// A packet waiting for the writer, with the token its write completes
#[derive(Debug)]
pub struct Outbound {
    pub packet: Packet,
    pub token: Option<Token>,
}

impl Outbound {
    /// Creates an entry with no token to complete
    #[must_use]
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            token: None,
        }
    }

    /// Creates an entry whose token is settled by the writer
    #[must_use]
    pub fn with_token(packet: Packet, token: Token) -> Self {
        Self {
            packet,
            token: Some(token),
        }
    }
}

impl Drop for Outbound {
    // A `QoS` 0 publish lives only here; if the connection dies before it is
    // written nobody else would settle its token.
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            if token.kind() == TokenKind::Publish {
                token.fail(MqttError::ConnectionLost(
                    "connection closed before the packet was written".to_string(),
                ));
            }
        }
    }
}

/// FIFO of packets for one connection's writer
///
/// Single consumer. Producers never block. Once closed every push is
/// refused, so nothing can slip into the queue of a dead connection.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: Mutex<QueueInner>,
    ready: Notify,
}

#[derive(Debug, Default)]
struct QueueInner {
    packets: VecDeque<Outbound>,
    closed: bool,
}

impl OutboundQueue {
    /// Creates an open, empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Errors
    ///
    /// `NotConnected` once the queue is closed; the packet is dropped
    pub fn push(&self, outbound: Outbound) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(MqttError::NotConnected);
            }
            inner.packets.push_back(outbound);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Waits for the next packet
    pub async fn pop(&self) -> Outbound {
        loop {
            if let Some(outbound) = self.lock().packets.pop_front() {
                return outbound;
            }
            self.ready.notified().await;
        }
    }

    /// Refuses further pushes and returns what was still queued, so the
    /// caller can fail the tokens
    pub fn close(&self) -> Vec<Outbound> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.packets.drain(..).collect()
    }

    /// Whether pushes are refused
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().packets.is_empty()
    }
}
