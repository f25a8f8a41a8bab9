use super::{Token, TokenKind};
use crate::error::{MqttError, Result};
use crate::packet::PublishPacket;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Key of the pending connect token
pub const CONNECT_KEY: &str = "Con";
/// Key of the pending disconnect token
pub const DISCONNECT_KEY: &str = "Disc";
/// Key of the outstanding ping token
pub const PING_KEY: &str = "Ping";

/// Store key of the operation using packet identifier `id`
#[must_use]
pub fn key_for_id(id: u16) -> String {
    id.to_string()
}

/// Rendezvous between callers creating operations and the dispatcher
/// resolving them
///
/// One mutex guards both the map and the quiesce state, so a save racing a
/// quiesce either lands before it (and is drained) or is rejected.
#[derive(Debug, Default)]
pub struct TokenStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tokens: HashMap<String, Token>,
    closed: Option<MqttError>,
}

impl StoreInner {
    fn delivery_count(&self) -> usize {
        self.tokens.values().filter(|token| token.is_delivery()).count()
    }
}

impl TokenStore {
    /// Creates an empty, open store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `token` under its key
    ///
    /// # Errors
    ///
    /// The quiesce reason if the store is closed. The token is failed with
    /// the same cause.
    pub fn save(&self, token: &Token) -> Result<()> {
        self.save_within(token, None)
    }

    /// Stores a delivery token unless `limit` delivery tokens are already
    /// outstanding. The count and the insert happen under one lock.
    ///
    /// # Errors
    ///
    /// `FlowControlExceeded` at the limit, otherwise as [`save`](Self::save)
    pub fn save_delivery(&self, token: &Token, limit: Option<u16>) -> Result<()> {
        self.save_within(token, limit.filter(|max| *max > 0))
    }

    fn save_within(&self, token: &Token, limit: Option<u16>) -> Result<()> {
        let rejected = {
            let mut inner = self.lock();
            if let Some(reason) = &inner.closed {
                Some(reason.clone())
            } else if let Some(max) =
                limit.filter(|max| inner.delivery_count() >= usize::from(*max))
            {
                Some(MqttError::FlowControlExceeded(max))
            } else {
                let key = token.key().to_string();
                if let Some(previous) = inner.tokens.insert(key, token.clone()) {
                    if !previous.same_as(token) {
                        warn!(key = %token.key(), "Replacing token with duplicate key");
                    }
                }
                None
            }
        };

        match rejected {
            Some(reason) => {
                // Failing runs the listener, which must not see the store locked
                token.fail(reason.clone());
                Err(reason)
            }
            None => Ok(()),
        }
    }

    /// Gets the token stored under `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Token> {
        self.lock().tokens.get(key).cloned()
    }

    /// Removes and returns the token stored under `key`
    pub fn remove(&self, key: &str) -> Option<Token> {
        self.lock().tokens.remove(key)
    }

    /// Checks whether a token is stored under `key`
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().tokens.contains_key(key)
    }

    /// Rejects further saves with `reason`; stored tokens are untouched
    pub fn quiesce(&self, reason: MqttError) {
        debug!(%reason, "Token store quiesced");
        self.lock().closed = Some(reason);
    }

    /// Accepts saves again
    pub fn open(&self) {
        self.lock().closed = None;
    }

    /// Whether saves are currently refused
    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Returns the delivery token tracking `publish`, creating it if the
    /// store has none. Restoring works while quiesced.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `publish` has no packet identifier
    pub fn restore(&self, publish: &PublishPacket) -> Result<Token> {
        let id = publish.packet_id.ok_or_else(|| {
            MqttError::InvalidArgument("cannot restore a publish without packet id".into())
        })?;
        let key = key_for_id(id);
        let mut inner = self.lock();
        if let Some(existing) = inner.tokens.get(&key) {
            if existing.kind() == TokenKind::Delivery {
                return Ok(existing.clone());
            }
            warn!(%key, "Restoring delivery token over a non-delivery token");
        }
        let token = Token::for_delivery(publish.clone());
        inner.tokens.insert(key, token.clone());
        Ok(token)
    }

    /// Snapshot of every stored token
    #[must_use]
    pub fn outstanding_tokens(&self) -> Vec<Token> {
        self.lock().tokens.values().cloned().collect()
    }

    /// Snapshot of stored delivery tokens, ordered by packet id
    #[must_use]
    pub fn outstanding_delivery_tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .lock()
            .tokens
            .values()
            .filter(|token| token.is_delivery())
            .cloned()
            .collect();
        tokens.sort_by_key(|token| token.key().parse::<u16>().unwrap_or(u16::MAX));
        tokens
    }

    /// Removes every token and returns them for the caller to fail
    pub fn drain(&self) -> Vec<Token> {
        self.lock().tokens.drain().map(|(_, token)| token).collect()
    }

    /// Removes and returns tokens matching `predicate`
    pub fn drain_where(&self, predicate: impl Fn(&Token) -> bool) -> Vec<Token> {
        let mut inner = self.lock();
        let keys: Vec<String> = inner
            .tokens
            .iter()
            .filter(|(_, token)| predicate(token))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| inner.tokens.remove(key))
            .collect()
    }

    /// Drops every token without completing it
    pub fn clear(&self) {
        self.lock().tokens.clear();
    }

    /// Number of stored tokens
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().tokens.len()
    }
}
