//! Model training registry and reconciliation
//!
//! - [`keys`] / [`models`]: composite keys, records, the status machine
//! - [`storage`]: typed storages per record kind
//! - [`lifecycle`]: compare-and-swap status transitions
//! - [`registry`]: model operations that keep the indexes consistent
//! - [`provider`]: the external training-status authority
//! - [`reconciler`]: per-scope polling loops

pub mod keys;
pub mod lifecycle;
pub mod models;
pub mod provider;
pub mod reconciler;
pub mod registry;
pub mod storage;

pub use keys::{ModelKey, ModelUserKey, PendingModelKey, PublicModelKey, Scope};
pub use lifecycle::TransitionOutcome;
pub use models::{ModelData, ModelUpdate, ModelUserData, PendingModelData, PublicModelData, Status};
pub use provider::{HttpTrainingProvider, TrainingStatusProvider};
pub use reconciler::{IterationReport, ReconcilerConfig, ScopeStatus, StatusReconciler};
pub use registry::ModelRegistry;
pub use storage::{ModelStorage, ModelUserStorage, PendingModelStorage, PublicModelStorage};
