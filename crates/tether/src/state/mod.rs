//! State channels: server-side publishing and client-side reconciliation.

pub mod client;
pub mod delta_log;
pub mod manager;

pub use client::{Reconciliation, StateChannelClient};
pub use delta_log::DeltaLog;
pub use manager::StateManager;
