//! Configuration for tollgate
//!
//! CLI arguments and environment variable handling using clap. Parsed once in
//! `main` and handed to each component constructor.

use clap::{ArgAction, Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::reconfig::OverflowPolicy;

/// Registry contract that emits organization metadata updates
pub const DEFAULT_REGISTRY_ADDRESS: &str = "0x4DCc70c6FCE4064803f0ae0cE48497B3f7182e5D";

/// Topic of the registry's metadata-URI update event
pub const DEFAULT_METADATA_EVENT_SIGNATURE: &str =
    "0x06ccb920be65231f5c9d04dd4883d3c7648ebe5f5317cc7177ee4f4a7cc2d038";

/// Tollgate - control plane for a payment-gated gRPC daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate")]
#[command(about = "Model lifecycle registry and on-chain reconfiguration for a payment-gated daemon")]
pub struct Args {
    /// Unique identifier for this daemon instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Organization id as registered on chain
    #[arg(long, env = "ORGANIZATION_ID", default_value = "")]
    pub organization_id: String,

    /// Service id within the organization
    #[arg(long, env = "SERVICE_ID", default_value = "")]
    pub service_id: String,

    /// Group this daemon serves, selected by name from the organization metadata
    #[arg(long, env = "DAEMON_GROUP_NAME", default_value = "default_group")]
    pub daemon_group_name: String,

    /// Address for the status server
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Enable development mode (relaxed validation, in-memory store fallback)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Follow organization updates on chain
    #[arg(
        long,
        env = "BLOCKCHAIN_ENABLED",
        action = ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub blockchain_enabled: bool,

    /// Ethereum JSON-RPC websocket endpoint
    #[arg(long, env = "ETHEREUM_WS_URL", default_value = "ws://localhost:8546")]
    pub ethereum_ws_url: String,

    /// Registry contract address
    #[arg(long, env = "REGISTRY_ADDRESS", default_value = DEFAULT_REGISTRY_ADDRESS)]
    pub registry_address: String,

    /// Event signature (topic 0) of organization metadata updates
    #[arg(long, env = "METADATA_EVENT_SIGNATURE", default_value = DEFAULT_METADATA_EVENT_SIGNATURE)]
    pub metadata_event_signature: String,

    /// Organization metadata URL; `{org_id}` is replaced with the organization id
    #[arg(long, env = "METADATA_URL")]
    pub metadata_url: Option<String>,

    /// Local organization metadata JSON, used instead of METADATA_URL when set
    #[arg(long, env = "METADATA_FILE")]
    pub metadata_file: Option<String>,

    /// Store configuration
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Reconcile model training status against the training provider
    #[arg(long, env = "MODEL_TRAINING_ENABLED", default_value = "false")]
    pub model_training_enabled: bool,

    /// Base URL of the training-status provider
    #[arg(long, env = "TRAINING_ENDPOINT")]
    pub training_endpoint: Option<String>,

    /// Seconds between reconciliation iterations
    #[arg(long, env = "MODEL_POLL_INTERVAL_SECS", default_value = "30")]
    pub model_poll_interval_secs: u64,

    /// Concurrent model updates within one scope
    #[arg(long, env = "MODEL_UPDATE_CONCURRENCY", default_value = "4")]
    pub model_update_concurrency: usize,

    /// Initial listener reconnect delay in milliseconds
    #[arg(long, env = "RECONNECT_DELAY_MS", default_value = "1000")]
    pub reconnect_delay_ms: u64,

    /// Upper bound for the listener reconnect delay in milliseconds
    #[arg(long, env = "MAX_RECONNECT_DELAY_MS", default_value = "30000")]
    pub max_reconnect_delay_ms: u64,

    /// Consecutive failed reconnects before giving up (0 = never)
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value = "0")]
    pub max_reconnect_attempts: u32,

    /// Per-subscriber buffer for reconfiguration triggers
    #[arg(long, env = "BROADCAST_BUFFER", default_value = "16")]
    pub broadcast_buffer: usize,

    /// What a full subscriber buffer discards
    #[arg(long, env = "BROADCAST_OVERFLOW", value_enum, default_value = "drop-oldest")]
    pub broadcast_overflow: OverflowPolicy,

    /// API key for admin triggers
    #[arg(long, env = "API_KEY_ADMIN")]
    pub admin_api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Store backend and credentials
#[derive(Parser, Debug, Clone)]
pub struct StorageArgs {
    /// Backend used for the model registry
    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value = "nats")]
    pub storage_backend: StorageBackend,

    /// JetStream key-value bucket holding registry records
    #[arg(long, env = "STORAGE_BUCKET", default_value = "tollgate")]
    pub storage_bucket: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// JetStream KV at the group's storage endpoints
    Nats,
    /// Process-local store
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Args {
    pub fn model_poll_interval(&self) -> Duration {
        Duration::from_secs(self.model_poll_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.organization_id.trim().is_empty() {
            return Err("ORGANIZATION_ID is required".to_string());
        }
        if self.service_id.trim().is_empty() {
            return Err("SERVICE_ID is required".to_string());
        }
        if self.metadata_url.is_none() && self.metadata_file.is_none() {
            return Err("METADATA_URL or METADATA_FILE is required".to_string());
        }
        if let Some(url) = &self.metadata_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("METADATA_URL must be an http(s) URL".to_string());
            }
        }
        if self.blockchain_enabled
            && !self.ethereum_ws_url.starts_with("ws://")
            && !self.ethereum_ws_url.starts_with("wss://")
        {
            return Err("ETHEREUM_WS_URL must be a ws(s) URL".to_string());
        }
        if self.model_training_enabled && self.training_endpoint.is_none() {
            return Err("TRAINING_ENDPOINT is required when MODEL_TRAINING_ENABLED".to_string());
        }
        if self.model_poll_interval_secs == 0 {
            return Err("MODEL_POLL_INTERVAL_SECS must be greater than zero".to_string());
        }
        if self.model_update_concurrency == 0 {
            return Err("MODEL_UPDATE_CONCURRENCY must be greater than zero".to_string());
        }
        if self.broadcast_buffer == 0 {
            return Err("BROADCAST_BUFFER must be greater than zero".to_string());
        }
        if self.reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err("RECONNECT_DELAY_MS must not exceed MAX_RECONNECT_DELAY_MS".to_string());
        }
        if !self.dev_mode && self.admin_api_key.is_none() {
            return Err("API_KEY_ADMIN is required in production mode".to_string());
        }
        Ok(())
    }
}
