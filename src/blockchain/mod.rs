//! On-chain organization configuration
//!
//! - [`metadata`]: the organization document and the daemon's group
//! - [`metadata_source`]: fetching the current document
//! - [`events`]: log filters, close classification, the event source seam
//! - [`ws_source`]: `eth_subscribe` over websocket

pub mod events;
pub mod metadata;
pub mod metadata_source;
pub mod ws_source;

pub use events::{
    org_id_topic, ChainLog, CloseReason, EventSource, LogFilter, LogSubscription,
    SubscriptionError,
};
pub use metadata::{Group, OrganizationMetaData, Payment, StorageClient};
pub use metadata_source::{FileMetadataSource, HttpMetadataSource, MetadataSource};
pub use ws_source::{EthWsEventSource, WsSourceConfig};
