//! Store connectors
//!
//! A connector turns the storage section of an organization's metadata into a
//! live store. The contract event listener calls it whenever the published
//! storage endpoints change.

use async_trait::async_trait;
use std::sync::Arc;

use super::memory::MemoryStore;
use super::nats_kv::{NatsKvOptions, NatsKvStore};
use super::AtomicStore;
use crate::blockchain::OrganizationMetaData;
use crate::types::{Result, TollgateError};

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, metadata: &OrganizationMetaData) -> Result<Arc<dyn AtomicStore>>;
}

/// Connects to a JetStream KV bucket at the group's storage endpoints
pub struct NatsKvConnector {
    bucket: String,
    user: Option<String>,
    password: Option<String>,
}

impl NatsKvConnector {
    pub fn new(bucket: impl Into<String>, user: Option<String>, password: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            user,
            password,
        }
    }

    pub fn options_for(&self, metadata: &OrganizationMetaData) -> Result<NatsKvOptions> {
        let servers: Vec<String> = metadata
            .storage_endpoints()
            .iter()
            .map(|endpoint| nats_server_url(endpoint))
            .collect();
        if servers.is_empty() {
            return Err(TollgateError::Metadata(
                "group has no payment channel storage endpoints".into(),
            ));
        }

        Ok(NatsKvOptions {
            servers,
            bucket: self.bucket.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            connection_timeout: metadata.connection_timeout()?,
            request_timeout: metadata.request_timeout()?,
        })
    }
}

#[async_trait]
impl StoreConnector for NatsKvConnector {
    async fn connect(&self, metadata: &OrganizationMetaData) -> Result<Arc<dyn AtomicStore>> {
        let options = self.options_for(metadata)?;
        let store = NatsKvStore::connect(&options).await?;
        Ok(Arc::new(store))
    }
}

/// Hands out fresh handles over one shared in-memory dataset
#[derive(Default)]
pub struct MemoryConnector {
    root: MemoryStore,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, _metadata: &OrganizationMetaData) -> Result<Arc<dyn AtomicStore>> {
        Ok(Arc::new(self.root.share()))
    }
}

/// Metadata endpoints are published as http(s) URLs; NATS wants its own schemes
fn nats_server_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("nats://{}", rest)
    } else if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("tls://{}", rest)
    } else {
        endpoint.to_string()
    }
}
