//! Organization metadata
//!
//! The registry contract points at an off-chain JSON document describing the
//! organization and its groups. The daemon serves exactly one group, chosen by
//! name; its payment section carries the storage endpoints the model registry
//! connects to. A metadata value is never mutated: an update replaces it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::types::{Result, TollgateError};

/// Used when the document leaves a storage timeout empty
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub group_name: String,
    /// Base64 of the 32-byte on-chain group id
    pub group_id: String,
    #[serde(default)]
    pub license_server_endpoints: Vec<String>,
    pub payment: Payment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    #[serde(default)]
    pub payment_address: String,
    #[serde(default)]
    pub payment_expiration_threshold: u64,
    #[serde(default)]
    pub payment_channel_storage_type: String,
    #[serde(default)]
    pub payment_channel_storage_client: StorageClient,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageClient {
    #[serde(default)]
    pub connection_timeout: String,
    #[serde(default)]
    pub request_timeout: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OrganizationDocument {
    #[serde(default)]
    org_name: String,
    org_id: String,
    #[serde(default)]
    groups: Vec<Group>,
}

/// Parsed organization metadata with the daemon's group resolved
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizationMetaData {
    pub org_name: String,
    pub org_id: String,
    pub groups: Vec<Group>,
    daemon_group: Group,
}

impl OrganizationMetaData {
    /// Parse a metadata document and select `group_name` as the daemon group.
    ///
    /// Fails when the group is missing, has no storage endpoints, has no
    /// payment address, or carries a group id that is not base64.
    pub fn from_json(raw: &[u8], group_name: &str) -> Result<Self> {
        let doc: OrganizationDocument = serde_json::from_slice(raw)
            .map_err(|e| TollgateError::Metadata(format!("invalid organization metadata: {}", e)))?;

        let daemon_group = doc
            .groups
            .iter()
            .find(|group| group.group_name == group_name)
            .cloned()
            .ok_or_else(|| {
                TollgateError::Metadata(format!(
                    "group name {} is not present in the metadata of {}",
                    group_name, doc.org_id
                ))
            })?;

        if daemon_group.payment.payment_channel_storage_client.endpoints.is_empty() {
            return Err(TollgateError::Metadata(format!(
                "group {} has no payment channel storage endpoints",
                group_name
            )));
        }
        if daemon_group.payment.payment_address.trim().is_empty() {
            return Err(TollgateError::Metadata(format!(
                "group {} has no payment address",
                group_name
            )));
        }
        STANDARD.decode(&daemon_group.group_id).map_err(|e| {
            TollgateError::Metadata(format!("group id of {} is not base64: {}", group_name, e))
        })?;

        let metadata = Self {
            org_name: doc.org_name,
            org_id: doc.org_id,
            groups: doc.groups,
            daemon_group,
        };
        // Surface unparseable timeouts at load time rather than on first connect
        metadata.connection_timeout()?;
        metadata.request_timeout()?;
        Ok(metadata)
    }

    pub fn daemon_group(&self) -> &Group {
        &self.daemon_group
    }

    /// Group id as published (base64), used in registry keys
    pub fn group_id(&self) -> &str {
        &self.daemon_group.group_id
    }

    pub fn payment_address(&self) -> &str {
        &self.daemon_group.payment.payment_address
    }

    pub fn storage_endpoints(&self) -> &[String] {
        &self.daemon_group.payment.payment_channel_storage_client.endpoints
    }

    pub fn storage_type(&self) -> &str {
        &self.daemon_group.payment.payment_channel_storage_type
    }

    pub fn connection_timeout(&self) -> Result<Duration> {
        parse_duration_or_default(
            &self.daemon_group.payment.payment_channel_storage_client.connection_timeout,
        )
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration_or_default(
            &self.daemon_group.payment.payment_channel_storage_client.request_timeout,
        )
    }

    /// Whether switching to `other` needs a new store connection.
    ///
    /// Endpoints compare as a set after trimming whitespace and trailing
    /// slashes; reordering the list does not force a reconnect.
    pub fn storage_endpoints_differ(&self, other: &OrganizationMetaData) -> bool {
        normalized_endpoints(self.storage_endpoints()) != normalized_endpoints(other.storage_endpoints())
    }
}

fn normalized_endpoints(endpoints: &[String]) -> BTreeSet<String> {
    endpoints
        .iter()
        .map(|e| e.trim().trim_end_matches('/').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn parse_duration_or_default(raw: &str) -> Result<Duration> {
    if raw.trim().is_empty() {
        return Ok(DEFAULT_STORAGE_TIMEOUT);
    }
    parse_duration(raw)
}

/// Parse durations like `15s`, `1500ms`, `1m30s`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let invalid = || TollgateError::Metadata(format!("invalid duration: {:?}", raw));
    let mut rest = raw.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ns" => Duration::from_nanos(value),
            "us" | "µs" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total = total.saturating_add(part);
    }
    Ok(total)
}
