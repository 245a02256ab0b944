//! Key-value storage for the model registry
//!
//! The registry only relies on a store that is linearizable per key and offers
//! compare-and-swap. Two backends implement [`AtomicStore`]:
//!
//! - [`MemoryStore`]: process-local, used in dev mode and tests
//! - [`NatsKvStore`]: JetStream key-value bucket at the group's storage endpoints
//!
//! Records are reached through [`TypedStore`], which owns the codec and the key
//! prefix of one entity kind, and always asks its [`StoreSource`] for the
//! current connection so a hot-swapped store is picked up on the next call.

pub mod connector;
pub mod memory;
pub mod nats_kv;
pub mod typed;

pub use connector::{MemoryConnector, NatsKvConnector, StoreConnector};
pub use memory::MemoryStore;
pub use nats_kv::NatsKvStore;
pub use typed::TypedStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::types::Result;

/// Linearizable key-value store with optimistic concurrency primitives.
///
/// Absence is reported as `None`/`false`, never as an error. Errors are
/// reserved for transport failures.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Read one key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Snapshot of every key starting with `prefix`, in no particular order
    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;

    /// Unconditional upsert
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Write only if the key does not exist. Returns whether it was created.
    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<bool>;

    /// Replace `expected` with `value`. Returns `false` when the stored bytes
    /// differ from `expected` or the key is gone.
    async fn compare_and_swap(&self, key: &str, expected: &[u8], value: Bytes) -> Result<bool>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release the connection. Later calls fail with a transport error.
    async fn close(&self) {}

    /// Short backend name for status reporting
    fn backend(&self) -> &'static str;
}

/// Anything that can hand out the store connection that is current right now
pub trait StoreSource: Send + Sync {
    fn current_store(&self) -> Arc<dyn AtomicStore>;
}

/// A source that always returns the same store
pub struct FixedStore(pub Arc<dyn AtomicStore>);

impl StoreSource for FixedStore {
    fn current_store(&self) -> Arc<dyn AtomicStore> {
        self.0.clone()
    }
}
