//! Reconfiguration signalling
//!
//! An in-process broadcaster for operator triggers plus the gate that
//! consumes them.

pub mod broadcaster;
pub mod gate;

pub use broadcaster::{Broadcaster, OverflowPolicy, Subscriber};
pub use gate::{ProcessingGate, Trigger};
