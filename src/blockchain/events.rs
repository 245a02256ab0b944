//! Contract log subscriptions
//!
//! An [`EventSource`] yields organization-update logs on one channel and
//! classified transport conditions on another. The listener only looks at the
//! [`CloseReason`] to decide whether to resubscribe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::Result;

/// Filter for `eth_subscribe("logs", ...)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogFilter {
    pub address: String,
    pub topics: Vec<String>,
}

impl LogFilter {
    /// Metadata updates emitted by `contract` for one organization
    pub fn organization_updates(contract: &str, event_signature: &str, org_id: &str) -> Self {
        Self {
            address: contract.to_string(),
            topics: vec![event_signature.to_string(), org_id_topic(org_id)],
        }
    }
}

/// Organization ids are indexed as `bytes32`: UTF-8, right-padded with zeros
pub fn org_id_topic(org_id: &str) -> String {
    let mut word = [0u8; 32];
    let bytes = org_id.as_bytes();
    let len = bytes.len().min(32);
    word[..len].copy_from_slice(&bytes[..len]);
    format!("0x{}", hex::encode(word))
}

/// One log entry as delivered by `eth_subscription`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    /// Set when a reorg retracted the log
    #[serde(default)]
    pub removed: bool,
}

/// Why a subscription stopped (or complained)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1006, also used when the stream drops without a close frame
    Abnormal,
    /// 1012
    ServiceRestart,
    /// 1013
    TryAgainLater,
    /// 1015
    TlsHandshake,
    /// Any other websocket close code
    Code(u16),
    /// Error reported by the node on a live subscription
    Rpc(String),
}

impl CloseReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1006 => Self::Abnormal,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1015 => Self::TlsHandshake,
            other => Self::Code(other),
        }
    }

    /// Reasons that warrant tearing down and resubscribing
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(
            self,
            Self::Normal
                | Self::GoingAway
                | Self::Abnormal
                | Self::ServiceRestart
                | Self::TryAgainLater
                | Self::TlsHandshake
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal closure"),
            Self::GoingAway => write!(f, "going away"),
            Self::Abnormal => write!(f, "abnormal closure"),
            Self::ServiceRestart => write!(f, "service restart"),
            Self::TryAgainLater => write!(f, "try again later"),
            Self::TlsHandshake => write!(f, "TLS handshake failure"),
            Self::Code(code) => write!(f, "close code {}", code),
            Self::Rpc(message) => write!(f, "rpc error: {}", message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionError {
    pub reason: CloseReason,
    pub message: String,
}

/// A live subscription. Dropping it stops the background reader.
pub struct LogSubscription {
    pub logs: mpsc::Receiver<ChainLog>,
    pub errors: mpsc::Receiver<SubscriptionError>,
    task: Option<JoinHandle<()>>,
}

impl LogSubscription {
    pub fn new(
        logs: mpsc::Receiver<ChainLog>,
        errors: mpsc::Receiver<SubscriptionError>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { logs, errors, task }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, filter: &LogFilter) -> Result<LogSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_id_topic_is_right_padded() {
        let topic = org_id_topic("snet");
        assert_eq!(topic.len(), 2 + 64);
        assert!(topic.starts_with("0x736e6574"));
        assert!(topic.ends_with(&"0".repeat(56)));
    }

    #[test]
    fn test_filter_topics() {
        let filter = LogFilter::organization_updates("0xabc", "0xsig", "snet");
        assert_eq!(filter.address, "0xabc");
        assert_eq!(filter.topics, vec!["0xsig".to_string(), org_id_topic("snet")]);
    }

    #[test]
    fn test_close_classification() {
        for code in [1000u16, 1001, 1006, 1012, 1013, 1015] {
            assert!(CloseReason::from_code(code).is_reconnect_eligible(), "code {}", code);
        }
        for code in [1002u16, 1003, 1008, 1011, 4000] {
            assert!(!CloseReason::from_code(code).is_reconnect_eligible(), "code {}", code);
        }
        assert!(!CloseReason::Rpc("filter not found".into()).is_reconnect_eligible());
    }

    #[test]
    fn test_chain_log_decoding() {
        let log: ChainLog = serde_json::from_value(serde_json::json!({
            "address": "0x4dcc70c6fce4064803f0ae0ce48497b3f7182e5d",
            "topics": ["0x06cc", "0x736e"],
            "data": "0x",
            "blockNumber": "0x10",
            "transactionHash": "0xfeed",
            "logIndex": "0x0"
        }))
        .unwrap();
        assert_eq!(log.block_number.as_deref(), Some("0x10"));
        assert!(!log.removed);
    }
}
