//! Status transitions committed through compare-and-swap
//!
//! No lock is taken anywhere: the store's compare-and-swap orders competing
//! writers, within one process or across many. A lost race is resolved by
//! re-reading. If the winner already wrote the status we wanted, that counts
//! as success. If it wrote something else, the caller gets
//! [`TollgateError::UnexpectedStatus`] and nothing is overwritten.

use tracing::debug;

use super::models::{ModelData, Status};
use super::storage::ModelStorage;
use crate::storage::typed::MAX_CAS_ATTEMPTS;
use crate::types::{Result, TollgateError};

/// Format of `ModelData::updated_date`
pub const UPDATED_DATE_FORMAT: &str = "%d-%m-%Y";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// This call wrote the new status
    Applied(ModelData),
    /// The record already carried the target status; nothing was written
    AlreadyApplied(ModelData),
}

impl TransitionOutcome {
    pub fn model(&self) -> &ModelData {
        match self {
            Self::Applied(model) | Self::AlreadyApplied(model) => model,
        }
    }

    pub fn into_model(self) -> ModelData {
        match self {
            Self::Applied(model) | Self::AlreadyApplied(model) => model,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

pub fn today() -> String {
    chrono::Utc::now().format(UPDATED_DATE_FORMAT).to_string()
}

fn with_status(current: &ModelData, target: Status, updated_by: Option<&str>) -> ModelData {
    let mut next = current.clone();
    next.status = target;
    next.updated_date = today();
    if let Some(address) = updated_by {
        next.updated_by_address = address.to_string();
    }
    next
}

/// Move `observed` to `target`, using `observed` as the compare-and-swap
/// expectation.
///
/// On a lost race the record is re-read: at `target` already means success,
/// still at the observed status means retry, anything else is reported as
/// unexpected.
pub async fn apply_transition(
    models: &ModelStorage,
    observed: ModelData,
    target: Status,
    updated_by: Option<&str>,
) -> Result<TransitionOutcome> {
    let key = observed.key();
    let expected = observed.status;

    if expected == target {
        return Ok(TransitionOutcome::AlreadyApplied(observed));
    }
    if !expected.can_transition_to(target) {
        return Err(TollgateError::InvalidTransition {
            from: expected.to_string(),
            to: target.to_string(),
        });
    }

    let mut current = observed;
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let next = with_status(&current, target, updated_by);
        if models.compare_and_swap(&key, &current, &next).await? {
            debug!(model_key = %key, from = %expected, to = %target, "Status committed");
            return Ok(TransitionOutcome::Applied(next));
        }

        let fresh = models
            .get(&key)
            .await?
            .ok_or_else(|| TollgateError::NotFound(format!("model {}", key)))?;
        if fresh.status == target {
            debug!(model_key = %key, status = %target, "Concurrent writer already applied status");
            return Ok(TransitionOutcome::AlreadyApplied(fresh));
        }
        if fresh.status != expected {
            return Err(TollgateError::UnexpectedStatus {
                key: models.storage_key(&key),
                expected: expected.to_string(),
                found: fresh.status.to_string(),
            });
        }
        debug!(model_key = %key, attempt, "Record changed under us, retrying transition");
        current = fresh;
    }

    Err(TollgateError::Conflict(format!(
        "transition of {} to {} kept losing races",
        key, target
    )))
}

/// Mark `observed` deleted. Deleting a deleted model writes nothing.
pub async fn apply_deletion(
    models: &ModelStorage,
    observed: ModelData,
    updated_by: Option<&str>,
) -> Result<TransitionOutcome> {
    let key = observed.key();
    let mut current = observed;

    for attempt in 1..=MAX_CAS_ATTEMPTS {
        if current.status == Status::Deleted {
            return Ok(TransitionOutcome::AlreadyApplied(current));
        }
        let next = with_status(&current, Status::Deleted, updated_by);
        if models.compare_and_swap(&key, &current, &next).await? {
            return Ok(TransitionOutcome::Applied(next));
        }
        debug!(model_key = %key, attempt, "Lost race while deleting, re-reading");
        current = models
            .get(&key)
            .await?
            .ok_or_else(|| TollgateError::NotFound(format!("model {}", key)))?;
    }

    Err(TollgateError::Conflict(format!("deletion of {} kept losing races", key)))
}
