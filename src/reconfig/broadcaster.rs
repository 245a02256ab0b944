//! Fan-out notifier for operator-triggered reconfiguration events
//!
//! Every subscriber reads from its own bounded window. `publish` never waits:
//! when a subscriber is full the configured [`OverflowPolicy`] decides which
//! event is lost, and the loss is counted on that subscriber only.
//!
//! - `DropOldest` rides on a `broadcast` channel; lagged reads are the drops.
//! - `DropNewest` keeps one bounded `mpsc` queue per subscriber and counts
//!   rejected sends.

use clap::ValueEnum;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// What to do when a subscriber's queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room for the new one
    #[default]
    DropOldest,
    /// Discard the event being published
    DropNewest,
}

struct QueueHandle {
    sender: mpsc::Sender<i32>,
    dropped: Arc<AtomicU64>,
}

enum Fanout {
    Lagging(broadcast::Sender<i32>),
    Bounded(Mutex<Vec<QueueHandle>>),
}

/// Publish/subscribe registry of bounded subscriber queues
pub struct Broadcaster {
    capacity: usize,
    policy: OverflowPolicy,
    fanout: Fanout,
    published: AtomicU64,
}

impl Broadcaster {
    /// `capacity` is the per-subscriber bound. Zero is raised to one, and
    /// `DropOldest` rounds it up to a power of two.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let (capacity, fanout) = match policy {
            OverflowPolicy::DropOldest => {
                let capacity = capacity.next_power_of_two();
                let (sender, _) = broadcast::channel(capacity);
                (capacity, Fanout::Lagging(sender))
            }
            OverflowPolicy::DropNewest => (capacity, Fanout::Bounded(Mutex::new(Vec::new()))),
        };
        Self {
            capacity,
            policy,
            fanout,
            published: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Register a new subscriber. It only sees events published after this call.
    pub fn subscribe(&self) -> Subscriber {
        let dropped = Arc::new(AtomicU64::new(0));
        let inbox = match &self.fanout {
            Fanout::Lagging(sender) => Inbox::Lagging(sender.subscribe()),
            Fanout::Bounded(queues) => {
                let (sender, receiver) = mpsc::channel(self.capacity);
                queues
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(QueueHandle {
                        sender,
                        dropped: Arc::clone(&dropped),
                    });
                Inbox::Bounded(receiver)
            }
        };
        debug!(policy = ?self.policy, "Broadcaster subscriber registered");
        Subscriber {
            inbox,
            capacity: self.capacity,
            dropped,
        }
    }

    /// Deliver `event` to every live subscriber. Returns how many queued it.
    ///
    /// Subscribers whose handle was dropped are pruned here.
    pub fn publish(&self, event: i32) -> usize {
        let delivered = match &self.fanout {
            // `Err` only means nobody is listening
            Fanout::Lagging(sender) => sender.send(event).unwrap_or(0),
            Fanout::Bounded(queues) => {
                let mut queues = queues.lock().unwrap_or_else(|e| e.into_inner());
                let mut delivered = 0;
                queues.retain(|queue| match queue.sender.try_send(event) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        queue.dropped.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
                delivered
            }
        };

        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(event, delivered, "Broadcast published");
        delivered
    }

    /// Number of subscribers still holding a handle
    pub fn subscriber_count(&self) -> usize {
        match &self.fanout {
            Fanout::Lagging(sender) => sender.receiver_count(),
            Fanout::Bounded(queues) => queues
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .filter(|queue| !queue.sender.is_closed())
                .count(),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

enum Inbox {
    Lagging(broadcast::Receiver<i32>),
    Bounded(mpsc::Receiver<i32>),
}

/// Receiving half of a broadcaster registration
pub struct Subscriber {
    inbox: Inbox,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl Subscriber {
    /// Next event in FIFO order. `None` once the broadcaster is gone and the
    /// queue has drained.
    pub async fn recv(&mut self) -> Option<i32> {
        match &mut self.inbox {
            Inbox::Lagging(receiver) => loop {
                match receiver.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        self.dropped.fetch_add(missed, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Inbox::Bounded(receiver) => receiver.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<i32> {
        match &mut self.inbox {
            Inbox::Lagging(receiver) => loop {
                match receiver.try_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                        self.dropped.fetch_add(missed, Ordering::Relaxed);
                    }
                    Err(_) => return None,
                }
            },
            Inbox::Bounded(receiver) => receiver.try_recv().ok(),
        }
    }

    /// Events lost to the overflow policy on this subscriber
    pub fn dropped(&self) -> u64 {
        let observed = self.dropped.load(Ordering::Relaxed);
        match &self.inbox {
            // Overwritten events not yet reported through a lagged read
            Inbox::Lagging(receiver) => {
                observed + receiver.len().saturating_sub(self.capacity) as u64
            }
            Inbox::Bounded(_) => observed,
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("dropped", &self.dropped())
            .finish()
    }
}
