//! Reconciliation engine integration tests
//!
//! Runs the supervised per-scope loops against the in-memory store with a
//! scripted training provider:
//! - convergence of a scope's queue over successive passes
//! - a full validate-then-train lifecycle driven by the loop
//! - restart after a worker panic
//! - shutdown at iteration boundaries

mod common;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use common::{memory_registry, model, scope};
use tollgate::training::{
    ModelData, ModelRegistry, ReconcilerConfig, Scope, Status, StatusReconciler,
    TrainingStatusProvider,
};
use tollgate::{Result, TollgateError};

/// Answers from a mutable table; unknown models report their own status
#[derive(Default)]
struct ScriptedProvider {
    answers: Mutex<HashMap<String, Status>>,
    failing: Mutex<Vec<String>>,
    panic_once: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn set(&self, id: &str, status: Status) {
        self.answers.lock().unwrap().insert(id.to_string(), status);
    }

    fn fail(&self, id: &str) {
        self.failing.lock().unwrap().push(id.to_string());
    }
}

#[async_trait]
impl TrainingStatusProvider for ScriptedProvider {
    async fn model_status(&self, model: &ModelData) -> Result<Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("provider blew up");
        }
        if self.failing.lock().unwrap().contains(&model.model_id) {
            return Err(TollgateError::Provider("unavailable".into()));
        }
        Ok(self
            .answers
            .lock()
            .unwrap()
            .get(&model.model_id)
            .copied()
            .unwrap_or(model.status))
    }
}

fn reconciler(registry: ModelRegistry, provider: Arc<ScriptedProvider>) -> Arc<StatusReconciler> {
    Arc::new(StatusReconciler::new(
        registry,
        provider,
        ReconcilerConfig {
            concurrency: 2,
            restart_delay: Duration::from_millis(10),
        },
    ))
}

async fn submit(registry: &ModelRegistry, id: &str) {
    registry.create_model(model(id, Status::Created)).await.unwrap();
    registry
        .submit_for_validation(&scope().model_key(id), None)
        .await
        .unwrap();
}

async fn wait_for_status(registry: &ModelRegistry, scope: &Scope, id: &str, status: Status) -> bool {
    for _ in 0..200 {
        if let Ok(Some(model)) = registry.get_model(&scope.model_key(id)).await {
            if model.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// =============================================================================
// Single passes
// =============================================================================

#[tokio::test]
async fn test_pending_pair_validated_in_one_pass() {
    let (registry, _) = memory_registry();
    let scope = scope();
    submit(&registry, "1").await;
    submit(&registry, "2").await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.set("1", Status::Validated);
    provider.set("2", Status::Validated);
    let reconciler = reconciler(registry.clone(), provider);
    let (_tx, rx) = watch::channel(false);

    let report = reconciler.reconcile_once(&scope, &rx).await;
    assert_eq!(report.examined, 2);
    assert_eq!(report.updated, 2);

    let pending = registry.pending().get(&scope.pending_key()).await.unwrap();
    assert!(pending.map(|p| p.model_ids.is_empty()).unwrap_or(true));
    for id in ["1", "2"] {
        let model = registry.get_model(&scope.model_key(id)).await.unwrap().unwrap();
        assert_eq!(model.status, Status::Validated);
    }
}

#[tokio::test]
async fn test_unchanged_and_failed_models_stay_queued() {
    let (registry, _) = memory_registry();
    let scope = scope();
    submit(&registry, "1").await;
    submit(&registry, "2").await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.fail("2");
    let reconciler = reconciler(registry.clone(), provider.clone());
    let (_tx, rx) = watch::channel(false);

    let report = reconciler.reconcile_once(&scope, &rx).await;
    assert_eq!(report.updated, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.pruned, 0);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

    let mut pending = registry.pending().pending_ids(&scope).await.unwrap();
    pending.sort();
    assert_eq!(pending, vec!["1", "2"]);
}

#[tokio::test]
async fn test_provider_reporting_backward_status_is_ignored() {
    let (registry, _) = memory_registry();
    let scope = scope();
    submit(&registry, "1").await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.set("1", Status::Created);
    let reconciler = reconciler(registry.clone(), provider);
    let (_tx, rx) = watch::channel(false);

    let report = reconciler.reconcile_once(&scope, &rx).await;
    assert_eq!(report.failed, 1);
    let model = registry.get_model(&scope.model_key("1")).await.unwrap().unwrap();
    assert_eq!(model.status, Status::Validating);
    assert_eq!(registry.pending().pending_ids(&scope).await.unwrap(), vec!["1"]);
}

#[tokio::test]
async fn test_stale_created_model_leaves_queue() {
    let (registry, _) = memory_registry();
    let scope = scope();
    // Queued, but the status flip never happened
    registry.create_model(model("1", Status::Created)).await.unwrap();
    registry.pending().add_pending_model_id(&scope, "1").await.unwrap();

    let provider = Arc::new(ScriptedProvider::default());
    provider.set("1", Status::Validated);
    let reconciler = reconciler(registry.clone(), provider.clone());
    let (_tx, rx) = watch::channel(false);

    let report = reconciler.reconcile_once(&scope, &rx).await;
    assert_eq!(report.pruned, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert!(registry.pending().pending_ids(&scope).await.unwrap().is_empty());

    let model = registry.get_model(&scope.model_key("1")).await.unwrap().unwrap();
    assert_eq!(model.status, Status::Created);

    // A later submission queues it again and the loop picks it up
    registry.submit_for_validation(&scope.model_key("1"), None).await.unwrap();
    reconciler.reconcile_once(&scope, &rx).await;
    let model = registry.get_model(&scope.model_key("1")).await.unwrap().unwrap();
    assert_eq!(model.status, Status::Validated);
    assert!(registry.pending().pending_ids(&scope).await.unwrap().is_empty());
}

// =============================================================================
// Supervised loops
// =============================================================================

#[tokio::test]
async fn test_loop_drives_full_lifecycle() {
    let (registry, _) = memory_registry();
    let scope = scope();
    let provider = Arc::new(ScriptedProvider::default());
    let reconciler = reconciler(registry.clone(), provider.clone());
    let (tx, rx) = watch::channel(false);

    let handle = reconciler
        .manage_update_model_status_workers(scope.clone(), Duration::from_millis(10), rx)
        .unwrap();

    submit(&registry, "1").await;
    provider.set("1", Status::Validated);
    assert!(wait_for_status(&registry, &scope, "1", Status::Validated).await);

    registry
        .start_training(&scope.model_key("1"), Some("0xCreator"))
        .await
        .unwrap();
    provider.set("1", Status::Trained);
    assert!(wait_for_status(&registry, &scope, "1", Status::Trained).await);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(registry.pending().pending_ids(&scope).await.unwrap().is_empty());
    assert!(reconciler.active_scopes().is_empty());
}

#[tokio::test]
async fn test_loop_restarts_after_panic() {
    let (registry, _) = memory_registry();
    let scope = scope();
    submit(&registry, "1").await;

    let provider = Arc::new(ScriptedProvider::default());
    provider.panic_once.store(true, Ordering::SeqCst);
    provider.set("1", Status::Validated);
    let reconciler = reconciler(registry.clone(), provider);
    let (tx, rx) = watch::channel(false);

    let handle = reconciler
        .manage_update_model_status_workers(scope.clone(), Duration::from_millis(10), rx)
        .unwrap();

    assert!(wait_for_status(&registry, &scope, "1", Status::Validated).await);
    let status = reconciler
        .active_scopes()
        .into_iter()
        .find(|s| s.scope == scope)
        .unwrap();
    assert!(status.restarts >= 1);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_scopes_are_independent() {
    let (registry, _) = memory_registry();
    let provider = Arc::new(ScriptedProvider::default());
    let reconciler = reconciler(registry.clone(), provider);
    let (tx, rx) = watch::channel(false);

    let a = Scope::new("org1", "svc1", "grp1");
    let b = Scope::new("org1", "svc2", "grp1");
    let first = reconciler.manage_update_model_status_workers(a.clone(), Duration::from_millis(10), rx.clone());
    let second = reconciler.manage_update_model_status_workers(b.clone(), Duration::from_millis(10), rx.clone());
    assert!(first.is_some() && second.is_some());
    assert!(reconciler
        .manage_update_model_status_workers(a.clone(), Duration::from_millis(10), rx)
        .is_none());
    assert_eq!(reconciler.active_scopes().len(), 2);

    tx.send(true).unwrap();
    for handle in [first, second].into_iter().flatten() {
        handle.await.unwrap();
    }
    assert!(!reconciler.is_active(&a));
    assert!(!reconciler.is_active(&b));
}
