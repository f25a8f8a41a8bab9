//! Application callbacks
//!
//! Callbacks run on the connection's reader task, in network receipt order.
//! A callback that blocks stalls the connection, so hand heavy work to
//! another task.

use crate::error::MqttError;
use crate::token::Token;
use crate::topic_matching;
use crate::types::Message;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Client-wide event handler; every method defaults to a no-op
pub trait MqttCallback: Send + Sync {
    /// The connection dropped without the application asking for it. Called
    /// once per lost connection.
    fn connection_lost(&self, _cause: &MqttError) {}

    /// A message arrived that no subscription listener claimed
    fn message_arrived(&self, _message: &Message) {}

    /// A `QoS` 1/2 publish received its final acknowledgement
    fn delivery_complete(&self, _token: &Token) {}

    /// A connection, first or automatic reconnect, was established
    fn connect_complete(&self, _reconnect: bool, _server_uri: &str) {}
}

/// Per-subscription message handler
pub type MessageListener = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    filter: String,
    listener: MessageListener,
}

/// Listeners registered through `subscribe_with_listeners`, keyed by filter
///
/// Filters without wildcards are looked up directly, wildcard filters are
/// matched one by one.
#[derive(Default)]
pub struct SubscriptionListeners {
    exact: RwLock<HashMap<String, MessageListener>>,
    wildcard: RwLock<Vec<ListenerEntry>>,
}

impl SubscriptionListeners {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `filter`, replacing any previous one
    pub fn register(&self, filter: &str, listener: MessageListener) {
        let actual = strip_shared_prefix(filter).unwrap_or(filter);
        if actual.contains(['+', '#']) {
            let mut wildcard = self.wildcard.write().unwrap_or_else(PoisonError::into_inner);
            wildcard.retain(|entry| entry.filter != actual);
            wildcard.push(ListenerEntry {
                filter: actual.to_string(),
                listener,
            });
        } else {
            self.exact
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(actual.to_string(), listener);
        }
    }

    /// Returns whether a listener was removed
    pub fn unregister(&self, filter: &str) -> bool {
        let actual = strip_shared_prefix(filter).unwrap_or(filter);
        if actual.contains(['+', '#']) {
            let mut wildcard = self.wildcard.write().unwrap_or_else(PoisonError::into_inner);
            let before = wildcard.len();
            wildcard.retain(|entry| entry.filter != actual);
            wildcard.len() < before
        } else {
            self.exact
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(actual)
                .is_some()
        }
    }

    /// Hands `message` to every matching listener
    ///
    /// Returns false when no listener matched, so the caller can fall back
    /// to the client callback. Listeners run after the locks are released.
    pub fn dispatch(&self, message: &Message) -> bool {
        let mut matched: Vec<MessageListener> = Vec::new();
        if let Some(listener) = self
            .exact
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.topic)
        {
            matched.push(listener.clone());
        }
        matched.extend(
            self.wildcard
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|entry| topic_matching::matches(&message.topic, &entry.filter))
                .map(|entry| entry.listener.clone()),
        );

        for listener in &matched {
            listener(message);
        }
        !matched.is_empty()
    }

    /// Number of registered listeners
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.read().unwrap_or_else(PoisonError::into_inner).len()
            + self.wildcard.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no listener is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every listener
    pub fn clear(&self) {
        self.exact.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.wildcard.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl std::fmt::Debug for SubscriptionListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionListeners")
            .field("count", &self.len())
            .finish()
    }
}

/// Strips `$share/<group>/` so shared subscriptions match on the topic part
fn strip_shared_prefix(filter: &str) -> Option<&str> {
    let after_share = filter.strip_prefix("$share/")?;
    let group_end = after_share.find('/')?;
    Some(&after_share[group_end + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PublishPacket;
    use crate::QoS;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(topic: &str) -> Message {
        Message::from(PublishPacket::new(topic, &b"data"[..], QoS::AtMostOnce))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> MessageListener {
        let counter = counter.clone();
        Arc::new(move |_msg: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_exact_match_listener() {
        let listeners = SubscriptionListeners::new();
        let counter = Arc::new(AtomicUsize::new(0));
        listeners.register("test/topic", counting(&counter));

        assert!(listeners.dispatch(&message("test/topic")));
        assert!(!listeners.dispatch(&message("test/other")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wildcard_listener() {
        let listeners = SubscriptionListeners::new();
        let counter = Arc::new(AtomicUsize::new(0));
        listeners.register("test/+/topic", counting(&counter));

        assert!(listeners.dispatch(&message("test/foo/topic")));
        assert!(listeners.dispatch(&message("test/bar/topic")));
        assert!(!listeners.dispatch(&message("test/topic")));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_overlapping_filters_all_fire() {
        let listeners = SubscriptionListeners::new();
        let counter = Arc::new(AtomicUsize::new(0));
        listeners.register("a/b", counting(&counter));
        listeners.register("a/#", counting(&counter));
        listeners.register("$share/group/a/+", counting(&counter));

        assert!(listeners.dispatch(&message("a/b")));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_register_replaces_and_unregister() {
        let listeners = SubscriptionListeners::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        listeners.register("s/#", counting(&first));
        listeners.register("s/#", counting(&second));
        assert_eq!(listeners.len(), 1);

        listeners.dispatch(&message("s/x"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(listeners.unregister("s/#"));
        assert!(!listeners.unregister("s/#"));
        assert!(listeners.is_empty());
    }
}
