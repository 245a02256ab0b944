//! Processing gate driven by reconfiguration triggers

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::broadcaster::{Broadcaster, Subscriber};

/// Integer-coded operator triggers carried by the broadcaster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    StopProcessing,
    StartProcessing,
}

impl Trigger {
    pub fn code(self) -> i32 {
        match self {
            Trigger::StopProcessing => 0,
            Trigger::StartProcessing => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Trigger::StopProcessing),
            1 => Some(Trigger::StartProcessing),
            _ => None,
        }
    }
}

/// Tracks whether the daemon should accept work.
///
/// Starts open; flips on every trigger received from the broadcaster.
pub struct ProcessingGate {
    processing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ProcessingGate {
    pub fn spawn(broadcaster: &Broadcaster, shutdown: watch::Receiver<bool>) -> Self {
        let processing = Arc::new(AtomicBool::new(true));
        let subscriber = broadcaster.subscribe();
        let task = tokio::spawn(run_gate(subscriber, Arc::clone(&processing), shutdown));
        Self { processing, task }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }
}

impl Drop for ProcessingGate {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_gate(
    mut subscriber: Subscriber,
    processing: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut watching = true;
    loop {
        let code = tokio::select! {
            code = subscriber.recv() => code,
            changed = shutdown.changed(), if watching => {
                match changed {
                    Ok(()) if *shutdown.borrow() => return,
                    Ok(()) => {}
                    // Shutdown sender gone: run until the broadcaster closes.
                    Err(_) => watching = false,
                }
                continue;
            }
        };

        let Some(code) = code else {
            return;
        };

        match Trigger::from_code(code) {
            Some(Trigger::StopProcessing) => {
                processing.store(false, Ordering::Release);
                info!("Request processing stopped by operator");
            }
            Some(Trigger::StartProcessing) => {
                processing.store(true, Ordering::Release);
                info!("Request processing started by operator");
            }
            None => warn!(code, "Ignoring unknown reconfiguration trigger"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconfig::OverflowPolicy;
    use std::time::Duration;

    #[test]
    fn test_trigger_codes() {
        assert_eq!(Trigger::StopProcessing.code(), 0);
        assert_eq!(Trigger::StartProcessing.code(), 1);
        assert_eq!(Trigger::from_code(1), Some(Trigger::StartProcessing));
        assert_eq!(Trigger::from_code(9), None);
    }

    async fn wait_for(gate: &ProcessingGate, expected: bool) -> bool {
        for _ in 0..100 {
            if gate.is_processing() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_gate_follows_triggers() {
        let broadcaster = Broadcaster::new(4, OverflowPolicy::DropOldest);
        let (_tx, rx) = watch::channel(false);
        let gate = ProcessingGate::spawn(&broadcaster, rx);
        assert!(gate.is_processing());

        broadcaster.publish(Trigger::StopProcessing.code());
        assert!(wait_for(&gate, false).await);

        broadcaster.publish(-3);
        broadcaster.publish(Trigger::StartProcessing.code());
        assert!(wait_for(&gate, true).await);
    }
}
