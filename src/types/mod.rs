//! Shared types for tollgate

pub mod error;

pub use error::{Result, TollgateError};
