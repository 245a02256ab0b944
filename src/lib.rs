//! Tollgate - control plane for a payment-gated service daemon
//!
//! Tollgate keeps the daemon's view of its organization in step with the
//! chain and tracks the lifecycle of the models its service trains.
//!
//! ## Components
//!
//! - **Registry**: model records and their secondary indexes in an atomic
//!   key-value store, with CAS-guarded status transitions
//! - **Reconciler**: per-scope polling loops that pull training status from
//!   the provider and write it back
//! - **Listener**: follows organization-update logs on chain and hot-swaps the
//!   live (metadata, store) pair
//! - **Reconfig**: in-process broadcaster for operator triggers

pub mod blockchain;
pub mod config;
pub mod listener;
pub mod logging;
pub mod reconfig;
pub mod routes;
pub mod server;
pub mod state;
pub mod storage;
pub mod training;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{Result, TollgateError};
