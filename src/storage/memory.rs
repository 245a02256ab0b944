//! In-process store backed by DashMap
//!
//! Each key lives in its own shard entry, so every operation on one key is
//! atomic. Handles created with [`MemoryStore::share`] see the same data but
//! close independently, which lets a hot swap retire the old handle without
//! losing records.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::AtomicStore;
use crate::types::{Result, TollgateError};

#[derive(Default)]
pub struct MemoryStore {
    data: Arc<DashMap<String, Bytes>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// New handle over the same data
    pub fn share(&self) -> Self {
        Self {
            data: self.data.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TollgateError::Transport("memory store handle is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        self.ensure_open()?;
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<bool> {
        self.ensure_open()?;
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(&self, key: &str, expected: &[u8], value: Bytes) -> Result<bool> {
        self.ensure_open()?;
        match self.data.get_mut(key) {
            Some(mut current) if current.as_ref() == expected => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.data.remove(key);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_if_absent_keeps_original() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("k", Bytes::from_static(b"a")).await.unwrap());
        assert!(!store.put_if_absent("k", Bytes::from_static(b"b")).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store.put("k", Bytes::from_static(b"v1")).await.unwrap();

        assert!(!store
            .compare_and_swap("k", b"stale", Bytes::from_static(b"v2"))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", b"v1", Bytes::from_static(b"v2"))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("missing", b"v1", Bytes::from_static(b"v2"))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(MemoryStore::new());
        store.put("k", Bytes::from_static(b"0")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap("k", b"0", Bytes::from(vec![b'a' + i]))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_prefix_scan() {
        let store = MemoryStore::new();
        store.put("/a/1", Bytes::from_static(b"1")).await.unwrap();
        store.put("/a/2", Bytes::from_static(b"2")).await.unwrap();
        store.put("/b/1", Bytes::from_static(b"3")).await.unwrap();

        let mut keys: Vec<String> = store
            .get_by_prefix("/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);
    }

    #[tokio::test]
    async fn test_shared_handles_close_independently() {
        let first = MemoryStore::new();
        first.put("k", Bytes::from_static(b"v")).await.unwrap();
        let second = first.share();

        first.close().await;
        assert!(first.get("k").await.is_err());
        assert_eq!(second.get("k").await.unwrap().unwrap(), Bytes::from_static(b"v"));
    }
}
