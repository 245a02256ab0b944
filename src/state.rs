//! The live (metadata, store) pair
//!
//! Both pieces are replaced together, never mutated, and published through a
//! single `watch` channel. A reader always gets one [`Generation`], so the
//! store it uses is the one that belongs to the metadata it sees.

use std::sync::Arc;
use tokio::sync::watch;

use crate::blockchain::OrganizationMetaData;
use crate::storage::{AtomicStore, StoreSource};

pub struct Generation {
    /// Increases by one on every publication
    pub number: u64,
    pub metadata: Arc<OrganizationMetaData>,
    pub store: Arc<dyn AtomicStore>,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("org_id", &self.metadata.org_id)
            .field("backend", &self.store.backend())
            .finish()
    }
}

pub struct LiveState {
    tx: watch::Sender<Arc<Generation>>,
}

impl LiveState {
    pub fn new(metadata: OrganizationMetaData, store: Arc<dyn AtomicStore>) -> Self {
        let (tx, _) = watch::channel(Arc::new(Generation {
            number: 1,
            metadata: Arc::new(metadata),
            store,
        }));
        Self { tx }
    }

    /// The generation current right now
    pub fn current(&self) -> Arc<Generation> {
        self.tx.borrow().clone()
    }

    /// Notified on every publication
    pub fn subscribe(&self) -> watch::Receiver<Arc<Generation>> {
        self.tx.subscribe()
    }

    /// Replace the pair if `expected` is still current. Returns the new
    /// generation, or `None` when someone else published first.
    pub fn publish_if_current(
        &self,
        expected: u64,
        metadata: OrganizationMetaData,
        store: Arc<dyn AtomicStore>,
    ) -> Option<Arc<Generation>> {
        let mut published = None;
        self.tx.send_if_modified(|current| {
            if current.number != expected {
                return false;
            }
            let next = Arc::new(Generation {
                number: expected + 1,
                metadata: Arc::new(metadata),
                store,
            });
            published = Some(next.clone());
            *current = next;
            true
        });
        published
    }
}

impl StoreSource for LiveState {
    fn current_store(&self) -> Arc<dyn AtomicStore> {
        self.current().store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::metadata::tests::sample_metadata;
    use crate::storage::MemoryStore;

    #[test]
    fn test_publish_advances_generation() {
        let live = LiveState::new(sample_metadata(&["http://a:2379"]), Arc::new(MemoryStore::new()));
        assert_eq!(live.current().number, 1);

        let next = live
            .publish_if_current(1, sample_metadata(&["http://b:2379"]), Arc::new(MemoryStore::new()))
            .unwrap();
        assert_eq!(next.number, 2);
        assert_eq!(live.current().metadata.storage_endpoints(), ["http://b:2379"]);
    }

    #[test]
    fn test_stale_publish_is_rejected() {
        let live = LiveState::new(sample_metadata(&["http://a:2379"]), Arc::new(MemoryStore::new()));
        live.publish_if_current(1, sample_metadata(&["http://b:2379"]), Arc::new(MemoryStore::new()))
            .unwrap();

        let stale =
            live.publish_if_current(1, sample_metadata(&["http://c:2379"]), Arc::new(MemoryStore::new()));
        assert!(stale.is_none());
        assert_eq!(live.current().number, 2);
    }

    #[test]
    fn test_readers_hold_their_snapshot() {
        let live = LiveState::new(sample_metadata(&["http://a:2379"]), Arc::new(MemoryStore::new()));
        let held = live.current();
        live.publish_if_current(1, sample_metadata(&["http://b:2379"]), Arc::new(MemoryStore::new()))
            .unwrap();

        assert_eq!(held.number, 1);
        assert_eq!(held.metadata.storage_endpoints(), ["http://a:2379"]);
    }
}
