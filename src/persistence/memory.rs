use super::MqttPersistence;
use crate::error::{MqttError, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Volatile persistence, one namespace per client identifier
///
/// Data outlives `close`, so one instance shared between two clients with
/// the same identifier behaves like a store that survived a process restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    current: Option<String>,
    clients: HashMap<String, BTreeMap<String, Bytes>>,
}

impl MemoryInner {
    fn namespace(&mut self) -> Result<&mut BTreeMap<String, Bytes>> {
        let client_id = self
            .current
            .as_ref()
            .ok_or_else(|| MqttError::Persistence("persistence is not open".to_string()))?;
        Ok(self.clients.entry(client_id.clone()).or_default())
    }
}

impl MemoryPersistence {
    /// Creates an empty in-memory persistence
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryInner) -> Result<T>) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| MqttError::Persistence("persistence lock poisoned".to_string()))?;
        f(&mut inner)
    }
}

impl MqttPersistence for MemoryPersistence {
    fn open(&self, client_id: &str) -> Result<()> {
        self.with_inner(|inner| {
            inner.current = Some(client_id.to_string());
            inner.clients.entry(client_id.to_string()).or_default();
            debug!(client_id, "Opened memory persistence");
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.current = None;
            Ok(())
        })
    }

    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.with_inner(|inner| {
            trace!(key, len = value.len(), "Persisting");
            inner.namespace()?.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.with_inner(|inner| Ok(inner.namespace()?.get(key).cloned()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_inner(|inner| {
            inner.namespace()?.remove(key);
            Ok(())
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.with_inner(|inner| Ok(inner.namespace()?.keys().cloned().collect()))
    }

    fn clear(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.namespace()?.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_open() {
        let store = MemoryPersistence::new();
        assert!(matches!(
            store.put("s-1", Bytes::from_static(b"x")),
            Err(MqttError::Persistence(_))
        ));
        assert!(store.keys().is_err());
    }

    #[test]
    fn test_put_get_remove() {
        let store = MemoryPersistence::new();
        store.open("client-a").unwrap();
        store.put("s-1", Bytes::from_static(b"one")).unwrap();
        store.put("r-2", Bytes::from_static(b"two")).unwrap();

        assert_eq!(store.get("s-1").unwrap(), Some(Bytes::from_static(b"one")));
        assert!(store.contains_key("r-2").unwrap());
        assert_eq!(store.keys().unwrap(), vec!["r-2".to_string(), "s-1".to_string()]);

        store.remove("s-1").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.get("s-1").unwrap(), None);
    }

    #[test]
    fn test_namespaces_are_per_client_and_survive_close() {
        let store = MemoryPersistence::new();
        store.open("a").unwrap();
        store.put("s-1", Bytes::from_static(b"a")).unwrap();
        store.close().unwrap();

        store.open("b").unwrap();
        assert!(store.keys().unwrap().is_empty());
        store.close().unwrap();

        store.open("a").unwrap();
        assert_eq!(store.get("s-1").unwrap(), Some(Bytes::from_static(b"a")));
        store.clear().unwrap();
        assert!(store.keys().unwrap().is_empty());
    }
}
