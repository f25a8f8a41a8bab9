//! Durable key to packet-bytes store consumed by the comms layer
//!
//! The engine never assumes the backing medium. Keys are strings, values are
//! the encoded bytes of the packet the key refers to.

mod memory;

pub use memory::MemoryPersistence;

use crate::error::Result;
use bytes::Bytes;

/// Storage for in-flight `QoS` 1/2 state that must survive a restart
///
/// `open` scopes every later call to one client identifier. Calls made while
/// no client is open fail with `MqttError::Persistence`.
pub trait MqttPersistence: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened for `client_id`
    fn open(&self, client_id: &str) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the store cannot be released
    fn close(&self) -> Result<()>;

    /// Stores `value` under `key`, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or the write fails
    fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the store is not open or the read fails
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Removing a missing key is not an error
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or the delete fails
    fn remove(&self, key: &str) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the store is not open
    fn keys(&self) -> Result<Vec<String>>;

    /// # Errors
    ///
    /// Returns an error if the store is not open
    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Removes every key of the open client
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open
    fn clear(&self) -> Result<()>;
}
