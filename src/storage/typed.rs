//! Typed records over an [`AtomicStore`]
//!
//! One `TypedStore` per entity kind. Values are JSON-encoded; struct fields
//! serialize in declaration order so equal values always produce equal bytes.
//! Storage keys are `{prefix}/{key}` where `key` renders through `Display`.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{AtomicStore, StoreSource};
use crate::types::{Result, TollgateError};

/// Compare-and-swap attempts before [`TypedStore::update`] reports a conflict
pub const MAX_CAS_ATTEMPTS: usize = 16;

pub struct TypedStore<K, V> {
    source: Arc<dyn StoreSource>,
    prefix: String,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            prefix: self.prefix.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> TypedStore<K, V>
where
    K: Display + Sync,
    V: Serialize + DeserializeOwned + PartialEq + Send + Sync,
{
    pub fn new(source: Arc<dyn StoreSource>, prefix: impl Into<String>) -> Self {
        Self {
            source,
            prefix: prefix.into(),
            _marker: PhantomData,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full storage key for `key`
    pub fn storage_key(&self, key: &K) -> String {
        format!("{}/{}", self.prefix, key)
    }

    fn store(&self) -> Arc<dyn AtomicStore> {
        self.source.current_store()
    }

    fn encode(&self, storage_key: &str, value: &V) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| TollgateError::serialization(storage_key, e))
    }

    fn decode(&self, storage_key: &str, raw: &[u8]) -> Result<V> {
        serde_json::from_slice(raw).map_err(|e| {
            warn!(key = %storage_key, error = %e, "Malformed stored value");
            TollgateError::serialization(storage_key, e)
        })
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let storage_key = self.storage_key(key);
        match self.store().get(&storage_key).await? {
            Some(raw) => self.decode(&storage_key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot of every record under this prefix, unordered
    pub async fn get_all(&self) -> Result<Vec<V>> {
        let scan = format!("{}/", self.prefix);
        self.store()
            .get_by_prefix(&scan)
            .await?
            .into_iter()
            .map(|(storage_key, raw)| self.decode(&storage_key, &raw))
            .collect()
    }

    pub async fn put(&self, key: &K, value: &V) -> Result<()> {
        let storage_key = self.storage_key(key);
        let encoded = self.encode(&storage_key, value)?;
        self.store().put(&storage_key, encoded).await
    }

    /// Returns `false` and leaves the stored record untouched if the key exists
    pub async fn put_if_absent(&self, key: &K, value: &V) -> Result<bool> {
        let storage_key = self.storage_key(key);
        let encoded = self.encode(&storage_key, value)?;
        self.store().put_if_absent(&storage_key, encoded).await
    }

    /// Swap `expected` for `new`. `false` means someone else wrote since the
    /// caller read `expected`; re-read and retry or give up.
    pub async fn compare_and_swap(&self, key: &K, expected: &V, new: &V) -> Result<bool> {
        let storage_key = self.storage_key(key);
        let store = self.store();

        let Some(raw) = store.get(&storage_key).await? else {
            return Ok(false);
        };
        if self.decode(&storage_key, &raw)? != *expected {
            return Ok(false);
        }

        let encoded = self.encode(&storage_key, new)?;
        store.compare_and_swap(&storage_key, &raw, encoded).await
    }

    pub async fn delete(&self, key: &K) -> Result<()> {
        let storage_key = self.storage_key(key);
        self.store().delete(&storage_key).await
    }

    /// Read-modify-write under compare-and-swap.
    ///
    /// `f` sees the current record (or `None`) and returns the replacement, or
    /// `None` to leave the record as it is. It may run several times. Returns
    /// the record as stored when the call finished.
    pub async fn update<F>(&self, key: &K, mut f: F) -> Result<Option<V>>
    where
        F: FnMut(Option<&V>) -> Option<V> + Send,
    {
        let storage_key = self.storage_key(key);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let store = self.store();
            let raw = store.get(&storage_key).await?;
            let current = match &raw {
                Some(raw) => Some(self.decode(&storage_key, raw)?),
                None => None,
            };

            let Some(next) = f(current.as_ref()) else {
                return Ok(current);
            };
            let encoded = self.encode(&storage_key, &next)?;

            let written = match raw {
                Some(raw) => store.compare_and_swap(&storage_key, &raw, encoded).await?,
                None => store.put_if_absent(&storage_key, encoded).await?,
            };
            if written {
                return Ok(Some(next));
            }
            debug!(key = %storage_key, attempt, "Lost compare-and-swap race, retrying");
        }

        Err(TollgateError::Conflict(format!(
            "{} still contended after {} attempts",
            storage_key, MAX_CAS_ATTEMPTS
        )))
    }
}
