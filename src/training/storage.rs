//! Typed storages for each registry record kind

use std::sync::Arc;

use super::keys::{ModelKey, ModelUserKey, PendingModelKey, PublicModelKey, Scope};
use super::models::{
    insert_id, remove_id, ModelData, ModelUserData, PendingModelData, PublicModelData,
};
use crate::storage::{StoreSource, TypedStore};
use crate::types::Result;

pub const MODEL_PREFIX: &str = "/model/storage";
pub const MODEL_USER_PREFIX: &str = "/model-user/storage";
pub const PENDING_MODEL_PREFIX: &str = "/pending-model/storage";
pub const PUBLIC_MODEL_PREFIX: &str = "/public-model/storage";

/// Generates the record operations on a wrapper around `TypedStore`
macro_rules! typed_storage {
    ($name:ident, $key:ty, $value:ty, $prefix:expr) => {
        #[derive(Clone)]
        pub struct $name {
            inner: TypedStore<$key, $value>,
        }

        impl $name {
            pub fn new(source: Arc<dyn StoreSource>) -> Self {
                Self {
                    inner: TypedStore::new(source, $prefix),
                }
            }

            pub fn storage_key(&self, key: &$key) -> String {
                self.inner.storage_key(key)
            }

            pub async fn get(&self, key: &$key) -> Result<Option<$value>> {
                self.inner.get(key).await
            }

            pub async fn get_all(&self) -> Result<Vec<$value>> {
                self.inner.get_all().await
            }

            pub async fn put(&self, key: &$key, value: &$value) -> Result<()> {
                self.inner.put(key, value).await
            }

            pub async fn put_if_absent(&self, key: &$key, value: &$value) -> Result<bool> {
                self.inner.put_if_absent(key, value).await
            }

            pub async fn compare_and_swap(
                &self,
                key: &$key,
                expected: &$value,
                new: &$value,
            ) -> Result<bool> {
                self.inner.compare_and_swap(key, expected, new).await
            }

            pub async fn delete(&self, key: &$key) -> Result<()> {
                self.inner.delete(key).await
            }

            /// Compare-and-swap read-modify-write, see [`TypedStore::update`]
            pub async fn update<F>(&self, key: &$key, f: F) -> Result<Option<$value>>
            where
                F: FnMut(Option<&$value>) -> Option<$value> + Send,
            {
                self.inner.update(key, f).await
            }
        }
    };
}

typed_storage!(ModelStorage, ModelKey, ModelData, MODEL_PREFIX);
typed_storage!(ModelUserStorage, ModelUserKey, ModelUserData, MODEL_USER_PREFIX);
typed_storage!(PendingModelStorage, PendingModelKey, PendingModelData, PENDING_MODEL_PREFIX);
typed_storage!(PublicModelStorage, PublicModelKey, PublicModelData, PUBLIC_MODEL_PREFIX);

impl ModelUserStorage {
    /// Add `model_id` to the user's index, creating the record when missing
    pub async fn add_model_id(&self, key: &ModelUserKey, model_id: &str) -> Result<()> {
        self.inner
            .update(key, |current| match current {
                Some(data) if data.model_ids.iter().any(|id| id == model_id) => None,
                Some(data) => {
                    let mut next = data.clone();
                    insert_id(&mut next.model_ids, model_id);
                    Some(next)
                }
                None => Some(ModelUserData {
                    model_ids: vec![model_id.to_string()],
                    organization_id: key.organization_id.clone(),
                    service_id: key.service_id.clone(),
                    group_id: key.group_id.clone(),
                }),
            })
            .await
            .map(|_| ())
    }

    pub async fn remove_model_id(&self, key: &ModelUserKey, model_id: &str) -> Result<()> {
        self.inner
            .update(key, |current| {
                let mut next = current?.clone();
                remove_id(&mut next.model_ids, model_id).then_some(next)
            })
            .await
            .map(|_| ())
    }
}

impl PendingModelStorage {
    /// Idempotently queue `model_id` for reconciliation in `scope`
    pub async fn add_pending_model_id(&self, scope: &Scope, model_id: &str) -> Result<()> {
        self.inner
            .update(&scope.pending_key(), |current| {
                let mut next = current.cloned().unwrap_or_default();
                insert_id(&mut next.model_ids, model_id).then_some(next)
            })
            .await
            .map(|_| ())
    }

    /// Drop `model_ids` from the queue. The record stays, possibly empty.
    pub async fn remove_pending_model_ids(&self, scope: &Scope, model_ids: &[String]) -> Result<()> {
        self.inner
            .update(&scope.pending_key(), |current| {
                let mut next = current?.clone();
                let mut changed = false;
                for id in model_ids {
                    changed |= remove_id(&mut next.model_ids, id);
                }
                changed.then_some(next)
            })
            .await
            .map(|_| ())
    }

    pub async fn remove_pending_model_id(&self, scope: &Scope, model_id: &str) -> Result<()> {
        self.remove_pending_model_ids(scope, &[model_id.to_string()]).await
    }

    /// Queued ids of `scope`; empty when the record is absent
    pub async fn pending_ids(&self, scope: &Scope) -> Result<Vec<String>> {
        Ok(self
            .get(&scope.pending_key())
            .await?
            .map(|pending| pending.model_ids)
            .unwrap_or_default())
    }
}

impl PublicModelStorage {
    pub async fn add_public_model_id(&self, scope: &Scope, model_id: &str) -> Result<()> {
        self.inner
            .update(&scope.public_key(), |current| {
                let mut next = current.cloned().unwrap_or_default();
                insert_id(&mut next.model_ids, model_id).then_some(next)
            })
            .await
            .map(|_| ())
    }

    pub async fn remove_public_model_id(&self, scope: &Scope, model_id: &str) -> Result<()> {
        self.inner
            .update(&scope.public_key(), |current| {
                let mut next = current?.clone();
                remove_id(&mut next.model_ids, model_id).then_some(next)
            })
            .await
            .map(|_| ())
    }
}
