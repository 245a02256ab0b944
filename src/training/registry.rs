//! Model registry
//!
//! Owns every registry record and the indexes around it. Status writes go
//! through [`lifecycle`](super::lifecycle); index records are maintained with
//! compare-and-swap updates so concurrent daemons never lose an id.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::keys::{ModelKey, Scope};
use super::lifecycle::{apply_deletion, apply_transition, today, TransitionOutcome};
use super::models::{ModelData, ModelUpdate, Status};
use super::provider::TrainingStatusProvider;
use super::storage::{ModelStorage, ModelUserStorage, PendingModelStorage, PublicModelStorage};
use crate::storage::typed::MAX_CAS_ATTEMPTS;
use crate::storage::StoreSource;
use crate::types::{Result, TollgateError};

#[derive(Clone)]
pub struct ModelRegistry {
    models: ModelStorage,
    users: ModelUserStorage,
    pending: PendingModelStorage,
    public: PublicModelStorage,
}

impl ModelRegistry {
    pub fn new(source: Arc<dyn StoreSource>) -> Self {
        Self {
            models: ModelStorage::new(source.clone()),
            users: ModelUserStorage::new(source.clone()),
            pending: PendingModelStorage::new(source.clone()),
            public: PublicModelStorage::new(source),
        }
    }

    pub fn models(&self) -> &ModelStorage {
        &self.models
    }

    pub fn users(&self) -> &ModelUserStorage {
        &self.users
    }

    pub fn pending(&self) -> &PendingModelStorage {
        &self.pending
    }

    pub fn public(&self) -> &PublicModelStorage {
        &self.public
    }

    pub async fn get_model(&self, key: &ModelKey) -> Result<Option<ModelData>> {
        self.models.get(key).await
    }

    async fn require_model(&self, key: &ModelKey) -> Result<ModelData> {
        self.models
            .get(key)
            .await?
            .ok_or_else(|| TollgateError::NotFound(format!("model {}", key)))
    }

    /// Register a new model in `CREATED` and index it for its users.
    pub async fn create_model(&self, mut model: ModelData) -> Result<ModelData> {
        if model.status != Status::Created {
            return Err(TollgateError::BadRequest(format!(
                "new models start in CREATED, got {}",
                model.status
            )));
        }
        if model.model_id.is_empty() {
            return Err(TollgateError::BadRequest("model id is required".into()));
        }
        if model.updated_date.is_empty() {
            model.updated_date = today();
        }

        let key = model.key();
        if !self.models.put_if_absent(&key, &model).await? {
            return Err(TollgateError::Conflict(format!("model {} already exists", key)));
        }

        let scope = model.scope();
        for address in model.indexed_addresses() {
            self.users.add_model_id(&scope.user_key(address), &model.model_id).await?;
        }
        if model.is_public {
            self.public.add_public_model_id(&scope, &model.model_id).await?;
        }

        info!(model_key = %key, "Model created");
        Ok(model)
    }

    /// `CREATED -> VALIDATING`. The id is queued before the status flips so
    /// the reconciliation loop can never miss a validating model.
    pub async fn submit_for_validation(
        &self,
        key: &ModelKey,
        updated_by: Option<&str>,
    ) -> Result<TransitionOutcome> {
        self.enter_polling(key, Status::Created, Status::Validating, updated_by)
            .await
    }

    /// `VALIDATED -> TRAINING`, queued for polling like validation.
    pub async fn start_training(
        &self,
        key: &ModelKey,
        updated_by: Option<&str>,
    ) -> Result<TransitionOutcome> {
        self.enter_polling(key, Status::Validated, Status::Training, updated_by)
            .await
    }

    async fn enter_polling(
        &self,
        key: &ModelKey,
        from: Status,
        to: Status,
        updated_by: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let current = self.require_model(key).await?;
        if current.status != from && current.status != to {
            return Err(TollgateError::UnexpectedStatus {
                key: self.models.storage_key(key),
                expected: from.to_string(),
                found: current.status.to_string(),
            });
        }

        let scope = key.scope();
        self.pending.add_pending_model_id(&scope, &key.model_id).await?;

        match apply_transition(&self.models, current, to, updated_by).await {
            Ok(outcome) => {
                if outcome.was_applied() {
                    // A reconciliation pass may have pruned the id between the
                    // first insert and the status flip
                    self.pending.add_pending_model_id(&scope, &key.model_id).await?;
                }
                info!(model_key = %key, status = %to, "Model queued for status polling");
                Ok(outcome)
            }
            Err(e) => {
                // Do not leave an id queued for a model that will never be polled
                if let Ok(Some(model)) = self.models.get(key).await {
                    if !model.status.requires_polling() {
                        if let Err(cleanup) =
                            self.pending.remove_pending_model_id(&scope, &key.model_id).await
                        {
                            warn!(model_key = %key, error = %cleanup, "Failed to dequeue model");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Commit `target` against the previously observed record
    pub async fn apply_status(
        &self,
        observed: ModelData,
        target: Status,
    ) -> Result<TransitionOutcome> {
        if target == Status::Deleted {
            apply_deletion(&self.models, observed, None).await
        } else {
            apply_transition(&self.models, observed, target, None).await
        }
    }

    /// Mark a model deleted and drop it from every index.
    ///
    /// Deleting an already deleted model succeeds without rewriting it.
    pub async fn delete_model(
        &self,
        key: &ModelKey,
        updated_by: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let current = self.require_model(key).await?;
        let outcome = apply_deletion(&self.models, current, updated_by).await?;

        let model = outcome.model();
        let scope = model.scope();
        for address in model.indexed_addresses() {
            self.users
                .remove_model_id(&scope.user_key(address), &model.model_id)
                .await?;
        }
        self.public.remove_public_model_id(&scope, &model.model_id).await?;
        self.pending.remove_pending_model_id(&scope, &model.model_id).await?;

        if outcome.was_applied() {
            info!(model_key = %key, "Model deleted");
        }
        Ok(outcome)
    }

    /// Rewrite the editable details of a model, keeping the indexes in step
    pub async fn update_model_access(
        &self,
        key: &ModelKey,
        update: ModelUpdate,
        updated_by: &str,
    ) -> Result<ModelData> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.require_model(key).await?;
            if current.status == Status::Deleted {
                return Err(TollgateError::BadRequest(format!("model {} is deleted", key)));
            }

            let mut next = current.clone();
            next.model_name = update.model_name.clone();
            next.description = update.description.clone();
            next.authorized_addresses = update.authorized_addresses.clone();
            next.is_public = update.is_public;
            next.updated_by_address = updated_by.to_string();
            next.updated_date = today();

            if !self.models.compare_and_swap(key, &current, &next).await? {
                debug!(model_key = %key, attempt, "Access update lost a race, retrying");
                continue;
            }

            let scope = key.scope();
            let before: BTreeSet<String> = current.indexed_addresses().into_iter().collect();
            let after: BTreeSet<String> = next.indexed_addresses().into_iter().collect();
            for removed in before.difference(&after) {
                self.users
                    .remove_model_id(&scope.user_key(removed.as_str()), &key.model_id)
                    .await?;
            }
            for added in after.difference(&before) {
                self.users
                    .add_model_id(&scope.user_key(added.as_str()), &key.model_id)
                    .await?;
            }
            match (current.is_public, next.is_public) {
                (false, true) => self.public.add_public_model_id(&scope, &key.model_id).await?,
                (true, false) => self.public.remove_public_model_id(&scope, &key.model_id).await?,
                _ => {}
            }
            return Ok(next);
        }

        Err(TollgateError::Conflict(format!(
            "access update of {} kept losing races",
            key
        )))
    }

    /// Ask the provider for the latest status of a polled model and commit it.
    ///
    /// Models outside a polling status are returned as stored.
    pub async fn refresh_model_status(
        &self,
        key: &ModelKey,
        provider: &dyn TrainingStatusProvider,
    ) -> Result<ModelData> {
        let current = self.require_model(key).await?;
        if !current.status.requires_polling() {
            return Ok(current);
        }

        let status = provider.model_status(&current).await?;
        if status == current.status {
            return Ok(current);
        }

        let model = self.apply_status(current, status).await?.into_model();
        if model.status.is_terminal_for_polling() {
            self.pending
                .remove_pending_model_id(&key.scope(), &key.model_id)
                .await?;
        }
        info!(model_key = %key, status = %model.status, "Model status refreshed");
        Ok(model)
    }

    /// Live models `user` may see in `scope`: their own index plus public models
    pub async fn accessible_models(&self, scope: &Scope, user: &str) -> Result<Vec<ModelData>> {
        let mut ids: Vec<String> = Vec::new();
        if let Some(index) = self.users.get(&scope.user_key(user)).await? {
            ids.extend(index.model_ids);
        }
        if let Some(index) = self.public.get(&scope.public_key()).await? {
            ids.extend(index.model_ids);
        }

        let mut seen = BTreeSet::new();
        let mut models = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(model) = self.models.get(&scope.model_key(id)).await? {
                if model.status != Status::Deleted && model.is_accessible_by(user) {
                    models.push(model);
                }
            }
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FixedStore, MemoryStore};
    use crate::training::models::tests::sample_model;
    use crate::training::models::ModelUpdate;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(FixedStore(Arc::new(MemoryStore::new()))))
    }

    #[tokio::test]
    async fn test_create_indexes_users() {
        let registry = registry();
        let model = registry
            .create_model(sample_model("1", Status::Created))
            .await
            .unwrap();
        let scope = model.scope();

        let creator = registry.users().get(&scope.user_key("0xCreator")).await.unwrap().unwrap();
        assert_eq!(creator.model_ids, vec!["1"]);
        let authorized = registry.users().get(&scope.user_key("0xAAA")).await.unwrap().unwrap();
        assert_eq!(authorized.model_ids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let registry = registry();
        registry.create_model(sample_model("1", Status::Created)).await.unwrap();
        let err = registry
            .create_model(sample_model("1", Status::Created))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_submit_queues_and_transitions() {
        let registry = registry();
        let model = registry.create_model(sample_model("1", Status::Created)).await.unwrap();

        let outcome = registry
            .submit_for_validation(&model.key(), Some("0xCreator"))
            .await
            .unwrap();
        assert_eq!(outcome.model().status, Status::Validating);
        assert_eq!(
            registry.pending().pending_ids(&model.scope()).await.unwrap(),
            vec!["1"]
        );

        // Resubmitting is a no-op success
        let again = registry.submit_for_validation(&model.key(), None).await.unwrap();
        assert!(!again.was_applied());
    }

    #[tokio::test]
    async fn test_start_training_requires_validated() {
        let registry = registry();
        let model = registry.create_model(sample_model("1", Status::Created)).await.unwrap();

        let err = registry.start_training(&model.key(), None).await.unwrap_err();
        assert!(matches!(err, TollgateError::UnexpectedStatus { .. }));
        assert!(registry.pending().pending_ids(&model.scope()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cleans_indexes() {
        let registry = registry();
        let mut model = sample_model("1", Status::Created);
        model.is_public = true;
        let model = registry.create_model(model).await.unwrap();
        registry.submit_for_validation(&model.key(), None).await.unwrap();

        let outcome = registry.delete_model(&model.key(), Some("0xCreator")).await.unwrap();
        assert!(outcome.was_applied());

        let scope = model.scope();
        assert!(registry.pending().pending_ids(&scope).await.unwrap().is_empty());
        let public = registry.public().get(&scope.public_key()).await.unwrap().unwrap();
        assert!(public.model_ids.is_empty());
        let creator = registry.users().get(&scope.user_key("0xCreator")).await.unwrap().unwrap();
        assert!(creator.model_ids.is_empty());

        let deleted = registry.get_model(&model.key()).await.unwrap().unwrap();
        let again = registry.delete_model(&model.key(), Some("0xOther")).await.unwrap();
        assert!(!again.was_applied());
        assert_eq!(registry.get_model(&model.key()).await.unwrap(), Some(deleted));
    }

    #[tokio::test]
    async fn test_access_update_moves_indexes() {
        let registry = registry();
        let model = registry.create_model(sample_model("1", Status::Created)).await.unwrap();
        let scope = model.scope();

        let updated = registry
            .update_model_access(
                &model.key(),
                ModelUpdate {
                    model_name: "renamed".into(),
                    description: "retrained weekly".into(),
                    authorized_addresses: vec!["0xBBB".into()],
                    is_public: true,
                },
                "0xCreator",
            )
            .await
            .unwrap();
        assert_eq!(updated.authorized_addresses, vec!["0xBBB"]);
        assert_eq!(updated.model_name, "renamed");
        assert_eq!(updated.description, "retrained weekly");

        let old = registry.users().get(&scope.user_key("0xAAA")).await.unwrap().unwrap();
        assert!(old.model_ids.is_empty());
        let new = registry.users().get(&scope.user_key("0xBBB")).await.unwrap().unwrap();
        assert_eq!(new.model_ids, vec!["1"]);

        let visible = registry.accessible_models(&scope, "0xanyone").await.unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_accessible_models_hides_deleted() {
        let registry = registry();
        let model = registry.create_model(sample_model("1", Status::Created)).await.unwrap();
        let other = registry.create_model(sample_model("2", Status::Created)).await.unwrap();
        registry.delete_model(&other.key(), None).await.unwrap();

        let visible = registry.accessible_models(&model.scope(), "0xAAA").await.unwrap();
        let ids: Vec<&str> = visible.iter().map(|m| m.model_id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
    }
}
