//! Tether daemon library.
//!
//! Manages agent sessions, persists conversations to SQLite and streams
//! state to browser clients through the [`hub::MessageHub`].
//!
//! ## Architecture
//!
//! ```text
//! browser <-> WebSocketServerTransport <-> MessageHub <-> {rpc handlers, StateManager}
//!                                                             |
//!                                                       SessionManager
//!                                                             |
//!                                                       AgentSession
//!                                      {ContextManager, RewindHandler, WorktreeManager, repositories}
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod events;
pub mod hub;
pub mod pairs;
pub mod rpc;
pub mod session;
pub mod settings;
pub mod state;
pub mod worktree;

pub use config::AppConfig;
pub use daemon::DaemonContext;
pub use db::Database;
