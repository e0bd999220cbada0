//! Wire protocol types for Tether.
//!
//! This crate defines every shape that crosses the daemon boundary:
//!
//! ```text
//! Browser <--[WS: HubMessage envelopes]--> Daemon (MessageHub) <--[in-process]--> Embedded agent
//! ```
//!
//! - [`hub`]: the `HubMessage` envelope shared by requests, responses and events.
//! - [`channels`]: channel, event and method names.
//! - [`session`]: sessions, messages, context accounting and rewind results.
//! - [`state`]: state-channel snapshot and delta payloads.
//! - [`settings`]: global and per-session settings.
//! - [`pair`]: manager/worker session pairs.

pub mod channels;
pub mod hub;
pub mod pair;
pub mod session;
pub mod settings;
pub mod state;

pub use hub::{ErrorCode, HubErrorPayload, HubMessage, MessageKind};

/// Current time as Unix milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
