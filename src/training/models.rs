//! Registry records and the model lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::keys::{ModelKey, Scope};
use crate::types::TollgateError;

/// Lifecycle status of a training model.
///
/// `CREATED -> VALIDATING -> VALIDATED -> TRAINING -> (TRAINED | ERRORED) -> DELETED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Created,
    Validating,
    Validated,
    Training,
    Trained,
    Errored,
    Deleted,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Created,
        Status::Validating,
        Status::Validated,
        Status::Training,
        Status::Trained,
        Status::Errored,
        Status::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "CREATED",
            Status::Validating => "VALIDATING",
            Status::Validated => "VALIDATED",
            Status::Training => "TRAINING",
            Status::Trained => "TRAINED",
            Status::Errored => "ERRORED",
            Status::Deleted => "DELETED",
        }
    }

    /// The reconciliation loop stops tracking a model once it reaches one of these
    pub fn is_terminal_for_polling(&self) -> bool {
        matches!(
            self,
            Status::Validated | Status::Trained | Status::Errored | Status::Deleted
        )
    }

    /// Statuses the training provider still has to resolve
    pub fn requires_polling(&self) -> bool {
        matches!(self, Status::Validating | Status::Training)
    }

    /// Position on the forward chain; `None` for statuses off the chain
    fn rank(&self) -> Option<u8> {
        match self {
            Status::Created => Some(0),
            Status::Validating => Some(1),
            Status::Validated => Some(2),
            Status::Training => Some(3),
            Status::Trained => Some(4),
            Status::Errored | Status::Deleted => None,
        }
    }

    /// Whether a record at `self` may move to `next`.
    ///
    /// Moves are forward only. `ERRORED` is reachable from any live status,
    /// `DELETED` from anything but itself, and nothing leaves `DELETED`.
    pub fn can_transition_to(&self, next: Status) -> bool {
        match (self, next) {
            (Status::Deleted, _) => false,
            (_, Status::Deleted) => true,
            (Status::Trained | Status::Errored, _) => false,
            (_, Status::Errored) => true,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| TollgateError::BadRequest(format!("unknown model status: {}", s)))
    }
}

/// One training model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelData {
    pub model_id: String,
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub grpc_service_name: String,
    #[serde(default)]
    pub grpc_method_name: String,
    #[serde(default)]
    pub training_link: String,
    /// `DD-MM-YYYY` of the last write
    #[serde(default)]
    pub updated_date: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub authorized_addresses: Vec<String>,
    #[serde(default)]
    pub created_by_address: String,
    #[serde(default)]
    pub updated_by_address: String,
    #[serde(default)]
    pub is_default: bool,
    pub status: Status,
}

impl ModelData {
    pub fn key(&self) -> ModelKey {
        self.scope().model_key(&self.model_id)
    }

    pub fn scope(&self) -> Scope {
        Scope::new(&self.organization_id, &self.service_id, &self.group_id)
    }

    /// Public models are visible to everyone; otherwise the creator and the
    /// authorized addresses. Addresses compare case-insensitively.
    pub fn is_accessible_by(&self, address: &str) -> bool {
        self.is_public
            || self.created_by_address.eq_ignore_ascii_case(address)
            || self
                .authorized_addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Everyone who should find this model in their user index
    pub fn indexed_addresses(&self) -> Vec<String> {
        let mut addresses = Vec::with_capacity(self.authorized_addresses.len() + 1);
        for address in std::iter::once(&self.created_by_address).chain(&self.authorized_addresses) {
            if address.is_empty() || addresses.iter().any(|a: &String| a.eq_ignore_ascii_case(address)) {
                continue;
            }
            addresses.push(address.clone());
        }
        addresses
    }
}

/// Editable details of a model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelUpdate {
    pub model_name: String,
    pub description: String,
    pub authorized_addresses: Vec<String>,
    pub is_public: bool,
}

/// Models visible to one user address within a scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUserData {
    #[serde(default)]
    pub model_ids: Vec<String>,
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
}

/// The reconciliation work queue of one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingModelData {
    #[serde(default)]
    pub model_ids: Vec<String>,
}

/// Public models of one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicModelData {
    #[serde(default)]
    pub model_ids: Vec<String>,
}

/// Ordered id list helpers shared by the index records
pub(crate) fn insert_id(ids: &mut Vec<String>, id: &str) -> bool {
    if ids.iter().any(|existing| existing == id) {
        return false;
    }
    ids.push(id.to_string());
    true
}

pub(crate) fn remove_id(ids: &mut Vec<String>, id: &str) -> bool {
    let before = ids.len();
    ids.retain(|existing| existing != id);
    ids.len() != before
}
