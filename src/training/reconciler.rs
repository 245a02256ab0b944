//! Model status reconciliation
//!
//! One supervised loop per scope drains the scope's pending queue: every
//! queued model is checked against the training-status provider and the
//! answer is committed with compare-and-swap. Models that reach a
//! terminal-for-polling status leave the queue.
//!
//! Failures are contained per model. A panic inside a loop restarts that
//! scope's loop after a delay; other scopes are unaffected.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::keys::Scope;
use super::provider::TrainingStatusProvider;
use super::registry::ModelRegistry;
use crate::types::TollgateError;

/// Reconciliation configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Concurrent model updates within one scope
    pub concurrency: usize,
    /// Pause before restarting a loop that panicked
    pub restart_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            restart_delay: Duration::from_secs(5),
        }
    }
}

/// What one pass over a scope's queue did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    /// Queued ids looked at
    pub examined: usize,
    /// Status writes this pass committed
    pub updated: usize,
    /// Ids removed from the queue
    pub pruned: usize,
    /// Models whose handling failed; retried next pass
    pub failed: usize,
    /// The pass stopped early on shutdown
    pub cancelled: bool,
}

/// Per-scope bookkeeping, exposed on the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStatus {
    pub scope: Scope,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub iterations: u64,
    pub restarts: u64,
    pub last_report: Option<IterationReport>,
}

enum ModelOutcome {
    Unchanged,
    Updated { applied: bool, prune: bool },
    Prune,
    Failed,
    Cancelled,
}

/// Removes the scope from the active set when its supervisor ends
struct ScopeSlot {
    active: Arc<DashMap<Scope, ScopeStatus>>,
    scope: Scope,
}

impl Drop for ScopeSlot {
    fn drop(&mut self) {
        self.active.remove(&self.scope);
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

pub struct StatusReconciler {
    registry: ModelRegistry,
    provider: Arc<dyn TrainingStatusProvider>,
    config: ReconcilerConfig,
    active: Arc<DashMap<Scope, ScopeStatus>>,
}

impl StatusReconciler {
    pub fn new(
        registry: ModelRegistry,
        provider: Arc<dyn TrainingStatusProvider>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn is_active(&self, scope: &Scope) -> bool {
        self.active.contains_key(scope)
    }

    /// Snapshot of every running scope loop
    pub fn active_scopes(&self) -> Vec<ScopeStatus> {
        let mut scopes: Vec<ScopeStatus> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        scopes.sort_by(|a, b| a.scope.cmp(&b.scope));
        scopes
    }

    /// Start the supervised polling loop for `scope`.
    ///
    /// Returns `None` when a loop for the scope is already running. The loop
    /// runs until `shutdown` flips to `true`.
    pub fn manage_update_model_status_workers(
        self: &Arc<Self>,
        scope: Scope,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        match self.active.entry(scope.clone()) {
            Entry::Occupied(_) => {
                warn!(scope = %scope, "Status workers already running for scope");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(ScopeStatus {
                    scope: scope.clone(),
                    started_at: chrono::Utc::now(),
                    iterations: 0,
                    restarts: 0,
                    last_report: None,
                });
            }
        }

        let slot = ScopeSlot {
            active: self.active.clone(),
            scope: scope.clone(),
        };
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            this.supervise(scope, poll_interval, shutdown).await;
            drop(slot);
        }))
    }

    async fn supervise(
        self: Arc<Self>,
        scope: Scope,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(scope = %scope, interval = ?poll_interval, "Starting model status workers");

        loop {
            let worker = tokio::spawn(self.clone().run_scope(
                scope.clone(),
                poll_interval,
                shutdown.clone(),
            ));

            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(scope = %scope, "Status worker panicked, restarting in {:?}", self.config.restart_delay);
                    if let Some(mut status) = self.active.get_mut(&scope) {
                        status.restarts += 1;
                    }
                }
                Err(_) => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.restart_delay) => {}
                _ = shutdown.changed() => {}
            }
            if is_shutdown(&shutdown) {
                break;
            }
        }

        info!(scope = %scope, "Model status workers stopped");
    }

    async fn run_scope(
        self: Arc<Self>,
        scope: Scope,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can ask us to stop any more, so stop now
                        break;
                    }
                }
            }
            if is_shutdown(&shutdown) {
                break;
            }

            let report = self.reconcile_once(&scope, &shutdown).await;
            if report.updated > 0 || report.pruned > 0 || report.failed > 0 {
                info!(
                    scope = %scope,
                    examined = report.examined,
                    updated = report.updated,
                    pruned = report.pruned,
                    failed = report.failed,
                    "Reconciliation pass finished"
                );
            } else {
                debug!(scope = %scope, examined = report.examined, "Reconciliation pass finished");
            }
            if let Some(mut status) = self.active.get_mut(&scope) {
                status.iterations += 1;
                status.last_report = Some(report);
            }
        }
    }

    /// One pass over the scope's pending queue
    pub async fn reconcile_once(
        &self,
        scope: &Scope,
        shutdown: &watch::Receiver<bool>,
    ) -> IterationReport {
        let mut report = IterationReport::default();

        let ids = match self.registry.pending().pending_ids(scope).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(scope = %scope, error = %e, "Failed to read pending models");
                report.failed += 1;
                return report;
            }
        };
        if ids.is_empty() {
            return report;
        }

        let outcomes: Vec<(String, ModelOutcome)> = stream::iter(ids)
            .map(|id| async move {
                let outcome = self.reconcile_model(scope, &id, shutdown).await;
                (id, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut prune = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                ModelOutcome::Cancelled => {
                    report.cancelled = true;
                    continue;
                }
                ModelOutcome::Unchanged => {}
                ModelOutcome::Failed => report.failed += 1,
                ModelOutcome::Prune => prune.push(id),
                ModelOutcome::Updated { applied, prune: done } => {
                    if applied {
                        report.updated += 1;
                    }
                    if done {
                        prune.push(id);
                    }
                }
            }
            report.examined += 1;
        }

        if !prune.is_empty() {
            match self.registry.pending().remove_pending_model_ids(scope, &prune).await {
                Ok(()) => {
                    report.pruned = prune.len();
                    self.requeue_if_polling(scope, &prune).await;
                }
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Failed to prune pending models");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// A model can re-enter a polling status between our read and the prune
    /// (training started on a validated model). Put those back.
    async fn requeue_if_polling(&self, scope: &Scope, pruned: &[String]) {
        for id in pruned {
            match self.registry.get_model(&scope.model_key(id.as_str())).await {
                Ok(Some(model)) if model.status.requires_polling() => {
                    debug!(scope = %scope, model_id = %id, "Model re-entered polling, requeueing");
                    if let Err(e) = self.registry.pending().add_pending_model_id(scope, id).await {
                        warn!(scope = %scope, model_id = %id, error = %e, "Failed to requeue model");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(scope = %scope, model_id = %id, error = %e, "Failed to re-check pruned model")
                }
            }
        }
    }

    async fn reconcile_model(
        &self,
        scope: &Scope,
        model_id: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> ModelOutcome {
        if is_shutdown(shutdown) {
            return ModelOutcome::Cancelled;
        }

        let key = scope.model_key(model_id);
        let model = match self.registry.get_model(&key).await {
            Ok(Some(model)) => model,
            Ok(None) => {
                warn!(scope = %scope, model_id, "Pending model has no record, dropping it");
                return ModelOutcome::Prune;
            }
            Err(e) => {
                warn!(scope = %scope, model_id, error = %e, "Failed to read model");
                return ModelOutcome::Failed;
            }
        };

        if model.status.is_terminal_for_polling() {
            return ModelOutcome::Prune;
        }
        if !model.status.requires_polling() {
            // Still CREATED: the submission never flipped the status. A
            // submission that is still in flight re-queues after its flip.
            debug!(scope = %scope, model_id, status = %model.status, "Dropping stale pending model");
            return ModelOutcome::Prune;
        }

        if is_shutdown(shutdown) {
            return ModelOutcome::Cancelled;
        }
        let observed = model.status;
        let status = match self.provider.model_status(&model).await {
            Ok(status) => status,
            Err(e) => {
                warn!(scope = %scope, model_id, error = %e, "Training provider query failed");
                return ModelOutcome::Failed;
            }
        };
        if status == observed {
            return ModelOutcome::Unchanged;
        }

        match self.registry.apply_status(model, status).await {
            Ok(outcome) => {
                let now = outcome.model().status;
                if outcome.was_applied() {
                    info!(scope = %scope, model_id, from = %observed, to = %now, "Model status updated");
                }
                ModelOutcome::Updated {
                    applied: outcome.was_applied(),
                    prune: now.is_terminal_for_polling(),
                }
            }
            Err(e @ TollgateError::UnexpectedStatus { .. }) => {
                error!(scope = %scope, model_id, error = %e, "Model moved to an unexpected status");
                ModelOutcome::Failed
            }
            Err(e @ TollgateError::InvalidTransition { .. }) => {
                error!(scope = %scope, model_id, error = %e, provider_status = %status, "Provider reported an impossible transition");
                ModelOutcome::Failed
            }
            Err(e) => {
                warn!(scope = %scope, model_id, error = %e, "Failed to commit model status");
                ModelOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FixedStore, MemoryStore};
    use crate::training::models::{tests::sample_model, ModelData, Status};
    use crate::types::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedProvider {
        answers: Mutex<HashMap<String, Result<Status>>>,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(answers: Vec<(&str, Result<Status>)>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(
                    answers
                        .into_iter()
                        .map(|(id, answer)| (id.to_string(), answer))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TrainingStatusProvider for FixedProvider {
        async fn model_status(&self, model: &ModelData) -> Result<Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.lock().unwrap().get(&model.model_id) {
                Some(Ok(status)) => Ok(*status),
                Some(Err(e)) => Err(TollgateError::Provider(e.to_string())),
                None => Ok(model.status),
            }
        }
    }

    async fn seeded(ids: &[(&str, Status)]) -> (ModelRegistry, Scope) {
        let registry = ModelRegistry::new(Arc::new(FixedStore(Arc::new(MemoryStore::new()))));
        let scope = Scope::new("org1", "svc1", "grp1");
        for (id, status) in ids {
            let model = sample_model(id, *status);
            registry.models().put(&model.key(), &model).await.unwrap();
            registry.pending().add_pending_model_id(&scope, id).await.unwrap();
        }
        (registry, scope)
    }

    #[tokio::test]
    async fn test_one_pass_drains_queue() {
        let (registry, scope) = seeded(&[("1", Status::Validating), ("2", Status::Validating)]).await;
        let provider = FixedProvider::new(vec![
            ("1", Ok(Status::Validated)),
            ("2", Ok(Status::Validated)),
        ]);
        let reconciler = StatusReconciler::new(registry.clone(), provider, ReconcilerConfig::default());
        let (_tx, rx) = watch::channel(false);

        let report = reconciler.reconcile_once(&scope, &rx).await;
        assert_eq!(report.updated, 2);
        assert_eq!(report.pruned, 2);
        assert!(registry.pending().pending_ids(&scope).await.unwrap().is_empty());
        for id in ["1", "2"] {
            let model = registry.get_model(&scope.model_key(id)).await.unwrap().unwrap();
            assert_eq!(model.status, Status::Validated);
        }
    }

    #[tokio::test]
    async fn test_provider_failure_is_isolated() {
        let (registry, scope) = seeded(&[("1", Status::Training), ("2", Status::Training)]).await;
        let provider = FixedProvider::new(vec![
            ("1", Err(TollgateError::Provider("boom".into()))),
            ("2", Ok(Status::Trained)),
        ]);
        let reconciler = StatusReconciler::new(registry.clone(), provider, ReconcilerConfig::default());
        let (_tx, rx) = watch::channel(false);

        let report = reconciler.reconcile_once(&scope, &rx).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(registry.pending().pending_ids(&scope).await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_terminal_and_missing_models_are_pruned_without_query() {
        let (registry, scope) = seeded(&[("1", Status::Errored)]).await;
        registry.pending().add_pending_model_id(&scope, "ghost").await.unwrap();
        let provider = FixedProvider::new(vec![]);
        let reconciler =
            StatusReconciler::new(registry.clone(), provider.clone(), ReconcilerConfig::default());
        let (_tx, rx) = watch::channel(false);

        let report = reconciler.reconcile_once(&scope, &rx).await;
        assert_eq!(report.pruned, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_pass_skips_provider() {
        let (registry, scope) = seeded(&[("1", Status::Validating)]).await;
        let provider = FixedProvider::new(vec![("1", Ok(Status::Validated))]);
        let reconciler =
            StatusReconciler::new(registry.clone(), provider.clone(), ReconcilerConfig::default());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = reconciler.reconcile_once(&scope, &rx).await;
        assert!(report.cancelled);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.pending().pending_ids(&scope).await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_one_loop_per_scope() {
        let (registry, scope) = seeded(&[]).await;
        let reconciler = Arc::new(StatusReconciler::new(
            registry,
            FixedProvider::new(vec![]),
            ReconcilerConfig::default(),
        ));
        let (tx, rx) = watch::channel(false);

        let first = reconciler.manage_update_model_status_workers(
            scope.clone(),
            Duration::from_millis(10),
            rx.clone(),
        );
        assert!(first.is_some());
        assert!(reconciler
            .manage_update_model_status_workers(scope.clone(), Duration::from_millis(10), rx)
            .is_none());
        assert!(reconciler.is_active(&scope));

        tx.send(true).unwrap();
        first.unwrap().await.unwrap();
        assert!(!reconciler.is_active(&scope));
    }
}
