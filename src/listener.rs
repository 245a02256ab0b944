//! Contract event listener
//!
//! Follows organization-update logs and keeps the live (metadata, store) pair
//! in step with the chain.
//!
//! ```text
//! DISCONNECTED -> SUBSCRIBING -> LISTENING -> RECOVERING -> SUBSCRIBING
//!                                                        \-> DISCONNECTED (retries exhausted)
//! ```
//!
//! Per event: fetch the current metadata; when the storage endpoints moved,
//! connect the new store first, publish the new pair, then close the old
//! store. If anything before the publication fails the old pair stays live.

use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::blockchain::{ChainLog, CloseReason, EventSource, LogFilter, LogSubscription, MetadataSource};
use crate::state::LiveState;
use crate::storage::StoreConnector;
use crate::types::{Result, TollgateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerState {
    Disconnected,
    Subscribing,
    Listening,
    Recovering,
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Delay before the first resubscribe attempt
    pub reconnect_delay: Duration,
    /// Cap for the exponential backoff
    pub max_reconnect_delay: Duration,
    /// Consecutive failed subscribe attempts before giving up (0 = infinite)
    pub max_reconnect_attempts: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 0,
        }
    }
}

/// Result of handling one update event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// New metadata published with the existing store
    MetadataRefreshed { generation: u64 },
    /// New metadata published with a new store; the old one was closed
    StoreSwapped { generation: u64 },
    /// Another publication won; this event's result was discarded
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub state: ListenerState,
    pub events_applied: u64,
    pub store_swaps: u64,
    pub resubscriptions: u64,
    pub last_error: Option<String>,
    pub last_block: Option<String>,
}

enum ListenExit {
    Shutdown,
    Recover(CloseReason),
}

pub struct ContractEventListener {
    organization_id: String,
    filter: LogFilter,
    config: ListenerConfig,
    events: Arc<dyn EventSource>,
    metadata: Arc<dyn MetadataSource>,
    connector: Arc<dyn StoreConnector>,
    live: Arc<LiveState>,
    state: watch::Sender<ListenerState>,
    events_applied: AtomicU64,
    store_swaps: AtomicU64,
    resubscriptions: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_block: RwLock<Option<String>>,
}

impl ContractEventListener {
    pub fn new(
        organization_id: impl Into<String>,
        filter: LogFilter,
        config: ListenerConfig,
        events: Arc<dyn EventSource>,
        metadata: Arc<dyn MetadataSource>,
        connector: Arc<dyn StoreConnector>,
        live: Arc<LiveState>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            organization_id: organization_id.into(),
            filter,
            config,
            events,
            metadata,
            connector,
            live,
            state,
            events_applied: AtomicU64::new(0),
            store_swaps: AtomicU64::new(0),
            resubscriptions: AtomicU64::new(0),
            last_error: RwLock::new(None),
            last_block: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub async fn status(&self) -> ListenerStatus {
        ListenerStatus {
            state: self.state(),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            store_swaps: self.store_swaps.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
            last_error: self.last_error.read().await.clone(),
            last_block: self.last_block.read().await.clone(),
        }
    }

    fn set_state(&self, next: ListenerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Listener state changed");
        }
    }

    async fn record_error(&self, message: String) {
        *self.last_error.write().await = Some(message);
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Returns an error only when the reconnect budget is exhausted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut failures = 0u32;
        let mut delay = self.config.reconnect_delay;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ListenerState::Subscribing);
            match self.events.subscribe(&self.filter).await {
                Ok(subscription) => {
                    failures = 0;
                    delay = self.config.reconnect_delay;
                    self.set_state(ListenerState::Listening);
                    info!(org = %self.organization_id, address = %self.filter.address, "Listening for organization updates");

                    match self.listen(subscription, &mut shutdown).await {
                        ListenExit::Shutdown => break,
                        ListenExit::Recover(reason) => {
                            warn!(org = %self.organization_id, reason = %reason, "Subscription closed, resubscribing");
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    error!(org = %self.organization_id, attempt = failures, error = %e, "Subscribe failed");
                    self.record_error(e.to_string()).await;

                    if self.config.max_reconnect_attempts > 0
                        && failures >= self.config.max_reconnect_attempts
                    {
                        self.set_state(ListenerState::Disconnected);
                        error!(
                            org = %self.organization_id,
                            "Max reconnection attempts ({}) reached, listener stopped",
                            self.config.max_reconnect_attempts
                        );
                        return Err(TollgateError::Subscription(format!(
                            "gave up after {} failed subscribe attempts: {}",
                            failures, e
                        )));
                    }
                }
            }

            self.set_state(ListenerState::Recovering);
            self.resubscriptions.fetch_add(1, Ordering::Relaxed);
            let wait = with_jitter(delay);
            debug!(wait = ?wait, "Waiting before resubscribing");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            delay = next_backoff(delay, self.config.max_reconnect_delay);
        }

        self.set_state(ListenerState::Disconnected);
        info!(org = %self.organization_id, "Contract event listener stopped");
        Ok(())
    }

    async fn listen(
        &self,
        mut subscription: LogSubscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ListenExit {
        let mut errors_open = true;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        subscription.unsubscribe();
                        return ListenExit::Shutdown;
                    }
                }

                closed = subscription.errors.recv(), if errors_open => match closed {
                    Some(closed) if closed.reason.is_reconnect_eligible() => {
                        return ListenExit::Recover(closed.reason);
                    }
                    Some(closed) => {
                        error!(
                            org = %self.organization_id,
                            reason = %closed.reason,
                            message = %closed.message,
                            "Subscription error, continuing to listen"
                        );
                        self.record_error(format!("{}: {}", closed.reason, closed.message)).await;
                    }
                    None => errors_open = false,
                },

                log = subscription.logs.recv() => match log {
                    Some(log) => self.process_log(&log).await,
                    None => {
                        // The source is gone whatever it reported before
                        return ListenExit::Recover(CloseReason::Abnormal);
                    }
                },
            }
        }
    }

    async fn process_log(&self, log: &ChainLog) {
        if log.removed {
            debug!(block = ?log.block_number, "Log retracted by reorg, refreshing anyway");
        }
        match self.handle_event(log).await {
            Ok(outcome) => {
                self.events_applied.fetch_add(1, Ordering::Relaxed);
                if let Some(block) = &log.block_number {
                    *self.last_block.write().await = Some(block.clone());
                }
                info!(org = %self.organization_id, outcome = ?outcome, "Organization update applied");
            }
            Err(e) => {
                error!(org = %self.organization_id, error = %e, "Failed to apply organization update, keeping current configuration");
                self.record_error(e.to_string()).await;
            }
        }
    }

    /// Apply one organization-update event to the live state
    pub async fn handle_event(&self, log: &ChainLog) -> Result<EventOutcome> {
        let previous = self.live.current();
        let metadata = self.metadata.fetch(&self.organization_id).await?;
        debug!(tx = ?log.transaction_hash, "Fetched organization metadata");

        if !metadata.storage_endpoints_differ(&previous.metadata) {
            return Ok(
                match self
                    .live
                    .publish_if_current(previous.number, metadata, previous.store.clone())
                {
                    Some(generation) => EventOutcome::MetadataRefreshed {
                        generation: generation.number,
                    },
                    None => EventOutcome::Superseded,
                },
            );
        }

        info!(
            org = %self.organization_id,
            from = ?previous.metadata.storage_endpoints(),
            to = ?metadata.storage_endpoints(),
            "Storage endpoints changed, connecting new store"
        );
        let store = self.connector.connect(&metadata).await?;

        match self
            .live
            .publish_if_current(previous.number, metadata, store.clone())
        {
            Some(generation) => {
                previous.store.close().await;
                self.store_swaps.fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome::StoreSwapped {
                    generation: generation.number,
                })
            }
            None => {
                store.close().await;
                Ok(EventOutcome::Superseded)
            }
        }
    }
}

fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) / 4;
    if spread == 0 {
        return delay;
    }
    delay.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=spread)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let wait = with_jitter(base);
            assert!(wait >= base && wait <= Duration::from_millis(1250));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let cap = Duration::from_secs(30);
        assert_eq!(next_backoff(Duration::from_secs(1), cap), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(20), cap), cap);

        let mut delay = Duration::from_millis(1);
        for _ in 0..100 {
            delay = next_backoff(delay, Duration::MAX);
        }
        assert_eq!(delay, Duration::MAX);
        assert!(with_jitter(Duration::MAX) >= Duration::MAX);
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&ListenerState::Recovering).unwrap(),
            "\"RECOVERING\""
        );
    }
}
