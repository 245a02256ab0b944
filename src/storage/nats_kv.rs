//! JetStream key-value backend
//!
//! Registry keys contain characters NATS subjects reject (`{`, `|`, `:`), so
//! they are stored hex-encoded. Hex keeps byte order, which means prefix scans
//! still work by decoding and filtering. Compare-and-swap rides on per-entry
//! revisions: a swap only lands if nobody wrote since the entry was read.

use async_nats::jetstream::{self, kv};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::AtomicStore;
use crate::types::{Result, TollgateError};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Connection settings for one bucket
#[derive(Debug, Clone)]
pub struct NatsKvOptions {
    pub servers: Vec<String>,
    pub bucket: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
}

pub struct NatsKvStore {
    client: Client,
    kv: kv::Store,
    bucket: String,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl NatsKvStore {
    /// Connect to the servers and open (or create) the bucket
    pub async fn connect(options: &NatsKvOptions) -> Result<Self> {
        let servers = options.servers.join(",");
        info!(servers = %servers, bucket = %options.bucket, "Connecting to NATS KV");

        let mut connect = ConnectOptions::new()
            .name(format!("tollgate-{}", options.bucket))
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(options.connection_timeout);

        if let (Some(user), Some(pass)) = (&options.user, &options.password) {
            connect = connect.user_and_password(user.clone(), pass.clone());
        }

        let client = connect
            .connect(servers.as_str())
            .await
            .map_err(|e| TollgateError::Transport(format!("Failed to connect to {}: {}", servers, e)))?;

        let store = Self::open(client, &options.bucket, options.request_timeout).await?;
        info!(servers = %servers, bucket = %options.bucket, "Connected to NATS KV");
        Ok(store)
    }

    /// Open the bucket on an existing client, creating it when missing
    pub async fn open(client: Client, bucket: &str, request_timeout: Duration) -> Result<Self> {
        let js = jetstream::new(client.clone());
        let kv = match js.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(e) => {
                debug!(bucket, error = %e, "Bucket not found, creating");
                js.create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    TollgateError::Transport(format!("Failed to open bucket {}: {}", bucket, e))
                })?
            }
        };

        Ok(Self {
            client,
            kv,
            bucket: bucket.to_string(),
            request_timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TollgateError::Transport(format!(
                "NATS KV connection for {} is closed",
                self.bucket
            )));
        }
        Ok(())
    }

    async fn timed<T, E, F>(&self, op: &str, key: &str, fut: F) -> Result<T>
    where
        E: std::fmt::Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        self.ensure_open()?;
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| TollgateError::Transport(format!("{} {} timed out", op, key)))?
            .map_err(|e| TollgateError::Transport(format!("{} {} failed: {}", op, key, e)))
    }

    /// Current live entry, ignoring delete and purge markers
    async fn live_entry(&self, key: &str) -> Result<Option<kv::Entry>> {
        let entry = self.timed("entry", key, self.kv.entry(encode_key(key))).await?;
        Ok(entry.filter(|e| matches!(e.operation, kv::Operation::Put)))
    }
}

#[async_trait]
impl AtomicStore for NatsKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.timed("get", key, self.kv.get(encode_key(key))).await
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let keys = self.timed("keys", prefix, self.kv.keys()).await?;
        tokio::pin!(keys);

        let mut matching = Vec::new();
        while let Some(next) = keys.next().await {
            let encoded = next
                .map_err(|e| TollgateError::Transport(format!("keys {} failed: {}", prefix, e)))?;
            match decode_key(&encoded) {
                Some(key) if key.starts_with(prefix) => matching.push(key),
                Some(_) => {}
                None => warn!(bucket = %self.bucket, key = %encoded, "Skipping foreign key in bucket"),
            }
        }

        let mut values = Vec::with_capacity(matching.len());
        for key in matching {
            // Deleted between listing and reading
            if let Some(value) = self.get(&key).await? {
                values.push((key, value));
            }
        }
        Ok(values)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.timed("put", key, self.kv.put(encode_key(key), value))
            .await
            .map(|_| ())
    }

    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<bool> {
        match self.timed("create", key, self.kv.create(encode_key(key), value)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                // A failed create is only a lost race if the key now exists
                if self.get(key).await?.is_some() {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn compare_and_swap(&self, key: &str, expected: &[u8], value: Bytes) -> Result<bool> {
        let Some(entry) = self.live_entry(key).await? else {
            return Ok(false);
        };
        if entry.value.as_ref() != expected {
            return Ok(false);
        }

        match self
            .timed("update", key, self.kv.update(encode_key(key), value, entry.revision))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let moved = self
                    .live_entry(key)
                    .await?
                    .map(|current| current.revision != entry.revision)
                    .unwrap_or(true);
                if moved {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.timed("delete", key, self.kv.delete(encode_key(key))).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.client.flush().await {
            warn!(bucket = %self.bucket, error = %e, "Flush on close failed");
        }
        info!(bucket = %self.bucket, "NATS KV connection closed");
    }

    fn backend(&self) -> &'static str {
        "nats-kv"
    }
}

/// Registry key to a NATS-safe KV key
pub fn encode_key(key: &str) -> String {
    hex::encode(key.as_bytes())
}

/// Inverse of [`encode_key`]; `None` for keys this crate did not write
pub fn decode_key(encoded: &str) -> Option<String> {
    hex::decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Store operations need a running NATS server with JetStream enabled

    #[test]
    fn test_key_encoding_is_subject_safe() {
        let key = "/model/storage/{ID:org|svc|grp|1}";
        let encoded = encode_key(key);
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }

    #[test]
    fn test_encoding_preserves_prefix() {
        let prefix = encode_key("/model/storage/");
        assert!(encode_key("/model/storage/{ID:a|b|c|d}").starts_with(&prefix));
        assert!(!encode_key("/model-user/storage/{ID:a|b|c|d}").starts_with(&prefix));
    }

    #[test]
    fn test_decode_rejects_foreign_keys() {
        assert_eq!(decode_key("not-hex"), None);
        assert_eq!(decode_key("ff"), None);
    }
}
