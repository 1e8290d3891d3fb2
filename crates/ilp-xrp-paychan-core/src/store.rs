//! `StoreWrapper`: a write-through cache over an async KV store, modeled on how
//! `interledger-store-redis` keeps an in-process mirror of account state so that
//! request handling can make synchronous decisions without waiting on Redis.
//!
//! The design requires writes to any key to complete in global issue order and to
//! survive concurrent `load`/`set` races with a "writer wins" rule. This is
//! implemented with a single background task draining an unbounded channel
//! (the serial write pipeline) plus a `parking_lot`-free, `tokio::sync::RwLock`
//! in-memory cache (async-safe across await points, unlike `parking_lot::RwLock`,
//! because `load` awaits the store while holding cache bookkeeping).

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::StoreError;

/// The narrow async KV interface the real persistent store must provide. Keys are
/// always strings; values are always strings (JSON-encodable records are just
/// strings that happen to be JSON, loaded through [`StoreWrapper::get_object`]).
#[async_trait]
pub trait PaychanStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

enum WriteOp {
    Put(String, String),
    Delete(String),
    Barrier(oneshot::Sender<()>),
}

pub struct StoreWrapper<S: PaychanStore> {
    store: Arc<S>,
    cache: RwLock<HashMap<String, String>>,
    writes: mpsc::UnboundedSender<WriteOp>,
}

impl<S: PaychanStore> StoreWrapper<S> {
    pub fn new(store: S) -> Self {
        let store = Arc::new(store);
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let worker_store = store.clone();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Put(key, value) => {
                        if let Err(err) = worker_store.put(&key, value).await {
                            tracing::error!(%key, %err, "store write failed, value will be retried on next set");
                        }
                    }
                    WriteOp::Delete(key) => {
                        if let Err(err) = worker_store.delete(&key).await {
                            tracing::error!(%key, %err, "store delete failed");
                        }
                    }
                    WriteOp::Barrier(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        StoreWrapper {
            store,
            cache: RwLock::new(HashMap::new()),
            writes: tx,
        }
    }

    /// Idempotent: does nothing if the key is already cached. A concurrent `set`
    /// that lands while the store fetch is in flight always wins over the fetched
    /// value, per the design's writer-wins rule.
    pub async fn load(&self, key: &str) {
        if self.cache.read().await.contains_key(key) {
            return;
        }
        let fetched = match self.store.get(key).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%key, %err, "store load failed, leaving key uncached");
                return;
            }
        };
        let Some(fetched) = fetched else {
            return;
        };
        let mut cache = self.cache.write().await;
        cache.entry(key.to_string()).or_insert(fetched);
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.cache.read().await.get(key).cloned()
    }

    pub async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await {
            Some(raw) => {
                let value = serde_json::from_str(&raw).map_err(|err| StoreError::Read {
                    key: key.to_string(),
                    source: Box::new(err),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: String) {
        self.cache.write().await.insert(key.to_string(), value.clone());
        let _ = self.writes.send(WriteOp::Put(key.to_string(), value));
    }

    pub async fn set_object<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|err| StoreError::Write {
            key: key.to_string(),
            source: Box::new(err),
        })?;
        self.set(key, raw).await;
        Ok(())
    }

    /// Cache-only write, used as an optimistic lock (e.g. marking a reverse-index
    /// entry as claimed before the persisted write has gone through).
    pub async fn set_cache(&self, key: &str, value: String) {
        self.cache.write().await.insert(key.to_string(), value);
    }

    pub async fn delete(&self, key: &str) {
        self.cache.write().await.remove(key);
        let _ = self.writes.send(WriteOp::Delete(key.to_string()));
    }

    /// Blocks until every write enqueued before this call has been applied.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writes.send(WriteOp::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeStore {
        data: StdMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl PaychanStore for FakeStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.data.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_then_get_sees_new_value_immediately() {
        let wrapper = StoreWrapper::new(FakeStore::default());
        wrapper.set("k", "v1".to_string()).await;
        assert_eq!(wrapper.get("k").await, Some("v1".to_string()));
    }

    #[tokio::test]
    async fn load_is_idempotent_once_cached() {
        let store = FakeStore::default();
        store.put("k", "from-store".to_string()).await.unwrap();
        let wrapper = StoreWrapper::new(store);
        wrapper.set("k", "from-writer".to_string()).await;
        wrapper.load("k").await;
        assert_eq!(wrapper.get("k").await, Some("from-writer".to_string()));
    }

    #[tokio::test]
    async fn close_drains_pending_writes() {
        let store = FakeStore::default();
        let wrapper = StoreWrapper::new(store);
        wrapper.set("k", "v".to_string()).await;
        wrapper.close().await;
        assert_eq!(wrapper.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_from_cache() {
        let wrapper = StoreWrapper::new(FakeStore::default());
        wrapper.set("k", "v".to_string()).await;
        wrapper.delete("k").await;
        assert_eq!(wrapper.get("k").await, None);
    }
}
