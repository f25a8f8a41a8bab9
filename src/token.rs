//! Completion handles for asynchronous MQTT operations
//!
//! Every operation returns a [`Token`]. The comms layer moves it to a
//! terminal state exactly once, success or failure, and every waiter (async,
//! blocking or listener) observes that single outcome.

mod store;

pub use store::{key_for_id, TokenStore, CONNECT_KEY, DISCONNECT_KEY, PING_KEY};

use crate::error::{MqttError, Result};
use crate::packet::{Packet, PublishPacket};
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::QoS;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Called once when the token reaches its terminal state
pub type CompletionListener = Box<dyn FnOnce(&Token) + Send>;

/// Arbitrary caller data carried by a token
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Operation a token tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Connect,
    Disconnect,
    Ping,
    /// `QoS` 0 publish, complete once written
    Publish,
    /// `QoS` 1/2 publish, complete on the final acknowledgement
    Delivery,
    Subscribe,
    Unsubscribe,
}

#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    key: String,
    kind: TokenKind,
    state: Mutex<TokenState>,
    condvar: Condvar,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct TokenState {
    completed: bool,
    error: Option<MqttError>,
    response: Option<Packet>,
    reason_codes: Vec<ReasonCode>,
    granted_qos: Vec<Option<QoS>>,
    session_present: bool,
    message: Option<PublishPacket>,
    topics: Vec<String>,
    user_context: Option<UserContext>,
    listener: Option<CompletionListener>,
}

impl Token {
    /// Creates a pending token stored under `key`
    #[must_use]
    pub fn new(key: impl Into<String>, kind: TokenKind) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                key: key.into(),
                kind,
                state: Mutex::new(TokenState::default()),
                condvar: Condvar::new(),
                done,
            }),
        }
    }

    /// Delivery token for a `QoS` 1/2 publish, keyed by its packet id
    #[must_use]
    pub fn for_delivery(publish: PublishPacket) -> Self {
        let key = publish.packet_id.map(|id| id.to_string()).unwrap_or_default();
        let token = Self::new(key, TokenKind::Delivery);
        token.lock().message = Some(publish);
        token
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the store key; the packet identifier for acknowledged operations
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Gets the operation kind
    #[must_use]
    pub fn kind(&self) -> TokenKind {
        self.inner.kind
    }

    /// Whether the token tracks a `QoS` 1/2 publish
    #[must_use]
    pub fn is_delivery(&self) -> bool {
        self.inner.kind == TokenKind::Delivery
    }

    /// Two handles refer to the same operation
    #[must_use]
    pub fn same_as(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the token reached its terminal state
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock().completed
    }

    /// Failure cause, `None` while pending or after success
    #[must_use]
    pub fn error(&self) -> Option<MqttError> {
        self.lock().error.clone()
    }

    /// The acknowledgement that completed the operation, if any
    #[must_use]
    pub fn response(&self) -> Option<Packet> {
        self.lock().response.clone()
    }

    /// Reason codes of the SUBACK or UNSUBACK
    #[must_use]
    pub fn reason_codes(&self) -> Vec<ReasonCode> {
        self.lock().reason_codes.clone()
    }

    /// Granted `QoS` per filter of a subscribe, `None` where refused
    #[must_use]
    pub fn granted_qos(&self) -> Vec<Option<QoS>> {
        self.lock().granted_qos.clone()
    }

    /// Session present flag of the CONNACK
    #[must_use]
    pub fn session_present(&self) -> bool {
        self.lock().session_present
    }

    /// The message of a publish token
    #[must_use]
    pub fn message(&self) -> Option<PublishPacket> {
        self.lock().message.clone()
    }

    pub(crate) fn set_message(&self, message: PublishPacket) {
        self.lock().message = Some(message);
    }

    /// Filters of a subscribe or unsubscribe token
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.lock().topics.clone()
    }

    pub(crate) fn set_topics(&self, topics: Vec<String>) {
        self.lock().topics = topics;
    }

    /// Gets the application context attached to the token
    #[must_use]
    pub fn user_context(&self) -> Option<UserContext> {
        self.lock().user_context.clone()
    }

    /// Attaches an application context
    pub fn set_user_context(&self, context: UserContext) {
        self.lock().user_context = Some(context);
    }

    /// Registers a listener run once on completion, immediately if the
    /// token is already complete. A later registration replaces an earlier
    /// one that has not run yet.
    pub fn on_complete(&self, listener: impl FnOnce(&Token) + Send + 'static) {
        let mut state = self.lock();
        if state.completed {
            drop(state);
            listener(self);
        } else {
            state.listener = Some(Box::new(listener));
        }
    }

    /// Completes successfully. Returns false if already terminal.
    pub fn complete(&self, response: Option<Packet>) -> bool {
        self.finish(response, None)
    }

    /// Fails with `error`. Returns false if already terminal.
    pub fn fail(&self, error: MqttError) -> bool {
        self.finish(None, Some(error))
    }

    /// Single terminal transition; keeps the response even on failure so a
    /// refused acknowledgement stays inspectable
    pub(crate) fn finish(&self, response: Option<Packet>, error: Option<MqttError>) -> bool {
        let listener = {
            let mut state = self.lock();
            if state.completed {
                return false;
            }
            state.completed = true;
            state.error = error;
            if let Some(packet) = &response {
                match packet {
                    Packet::ConnAck(connack) => {
                        state.session_present = connack.session_present;
                        state.reason_codes = vec![connack.reason_code];
                    }
                    Packet::SubAck(suback) => {
                        state.reason_codes.clone_from(&suback.reason_codes);
                        state.granted_qos = suback.granted_qos();
                    }
                    Packet::UnsubAck(unsuback) => {
                        state.reason_codes.clone_from(&unsuback.reason_codes);
                    }
                    Packet::PubAck(ack) => state.reason_codes = vec![ack.reason_code],
                    Packet::PubRec(ack) => state.reason_codes = vec![ack.reason_code],
                    Packet::PubComp(ack) => state.reason_codes = vec![ack.reason_code],
                    _ => {}
                }
            }
            state.response = response;
            state.listener.take()
        };

        self.inner.condvar.notify_all();
        self.inner.done.send_replace(true);
        if let Some(listener) = listener {
            listener(self);
        }
        true
    }

    fn result(&self) -> Result<()> {
        match &self.lock().error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Waits until the operation finishes
    ///
    /// # Errors
    ///
    /// The failure cause of the operation
    pub async fn wait(&self) -> Result<()> {
        let mut done = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this cannot see a closed channel
        let _ = done.wait_for(|done| *done).await;
        self.result()
    }

    /// Waits at most `timeout`. Timing out leaves the operation running.
    ///
    /// # Errors
    ///
    /// `Timeout` if still pending after `timeout`, else the failure cause
    pub async fn wait_for(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| MqttError::Timeout)?
    }

    /// Blocks the calling thread until completion or `timeout`
    ///
    /// For callers outside the async runtime; never call this from a
    /// runtime worker thread.
    ///
    /// # Errors
    ///
    /// `Timeout` if still pending after `timeout`, else the failure cause
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Result<()> {
        let guard = self.lock();
        let guard = match timeout {
            None => self
                .inner
                .condvar
                .wait_while(guard, |state| !state.completed)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (guard, _) = self
                    .inner
                    .condvar
                    .wait_timeout_while(guard, timeout, |state| !state.completed)
                    .unwrap_or_else(PoisonError::into_inner);
                if !guard.completed {
                    return Err(MqttError::Timeout);
                }
                guard
            }
        };
        match &guard.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Token")
            .field("key", &self.inner.key)
            .field("kind", &self.inner.kind)
            .field("completed", &state.completed)
            .field("error", &state.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ConnAckPacket, SubAckPacket};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_terminal_state_is_set_once() {
        let token = Token::new("7", TokenKind::Subscribe);
        assert!(!token.is_complete());
        assert!(token.fail(MqttError::ConnectionLost("eof".into())));
        assert!(!token.complete(None));
        assert!(!token.fail(MqttError::Timeout));
        assert_eq!(token.error(), Some(MqttError::ConnectionLost("eof".into())));
    }

    #[test]
    fn test_listener_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = Token::new(CONNECT_KEY, TokenKind::Connect);
        let counter = calls.clone();
        token.on_complete(move |t| {
            assert!(t.is_complete());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        token.complete(Some(Packet::ConnAck(ConnAckPacket::new(true, ReasonCode::Success))));
        token.complete(None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(token.session_present());

        let counter = calls.clone();
        token.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_suback_response_fields() {
        let token = Token::new("3", TokenKind::Subscribe);
        let suback = SubAckPacket::new(3)
            .add_granted_qos(QoS::AtLeastOnce)
            .add_reason_code(ReasonCode::NotAuthorized);
        token.complete(Some(Packet::SubAck(suback)));
        assert_eq!(token.granted_qos(), vec![Some(QoS::AtLeastOnce), None]);
        assert_eq!(
            token.reason_codes(),
            vec![ReasonCode::GrantedQoS1, ReasonCode::NotAuthorized]
        );
    }

    #[test]
    fn test_user_context() {
        let token = Token::new("1", TokenKind::Publish);
        token.set_user_context(Arc::new(42u32));
        let context = token.user_context().unwrap();
        assert_eq!(context.downcast_ref::<u32>(), Some(&42));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let token = Token::new("5", TokenKind::Delivery);
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        token.complete(None);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout_does_not_fail_token() {
        let token = Token::new("5", TokenKind::Delivery);
        assert_eq!(
            token.wait_for(Duration::from_secs(1)).await,
            Err(MqttError::Timeout)
        );
        assert!(!token.is_complete());
        assert!(token.error().is_none());

        token.fail(MqttError::ConnectionClosed);
        assert_eq!(token.wait().await, Err(MqttError::ConnectionClosed));
    }

    #[test]
    fn test_wait_blocking_across_threads() {
        let token = Token::new("9", TokenKind::Delivery);
        assert_eq!(
            token.wait_blocking(Some(Duration::from_millis(10))),
            Err(MqttError::Timeout)
        );

        let completer = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(None);
        });
        assert!(token.wait_blocking(None).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_delivery_token_key() {
        let publish = PublishPacket::new("a", &b"x"[..], QoS::ExactlyOnce).with_packet_id(12);
        let token = Token::for_delivery(publish);
        assert_eq!(token.key(), "12");
        assert!(token.is_delivery());
        assert_eq!(token.message().unwrap().packet_id, Some(12));
    }
}
