//! RPC method handlers registered on the [`MessageHub`].
//!
//! Each handler is a plain async function taking the shared [`RpcContext`]
//! and its typed params. [`register_all`] wires every method name from
//! [`tether_protocol::channels::methods`] to its handler.

pub mod error;
pub mod handlers;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;

pub use error::{RpcError, RpcResult};

use crate::events::DaemonEvent;
use crate::hub::{InProcessHub, MessageHub, RequestContext, Unsubscribe};
use crate::pairs::PairRepository;
use crate::session::{AgentSession, SessionError, SessionManager};
use crate::settings::SettingsRepository;
use crate::state::StateManager;
use crate::worktree::WorktreeManager;

/// Everything a handler may touch. Cheap to clone.
#[derive(Clone)]
pub struct RpcContext {
    pub hub: MessageHub,
    pub sessions: Arc<SessionManager>,
    pub state: Arc<StateManager>,
    pub settings: SettingsRepository,
    pub pairs: PairRepository,
    pub worktrees: Arc<WorktreeManager>,
    pub events: InProcessHub<DaemonEvent>,
}

impl RpcContext {
    /// Live session for `session_id`, or a `Session not found: <id>` error.
    pub async fn session(&self, session_id: &str) -> RpcResult<Arc<AgentSession>> {
        self.sessions
            .get_session_async(session_id)
            .await?
            .ok_or_else(|| RpcError::not_found(SessionError::NotFound(session_id.to_string()).to_string()))
    }

    /// Fails unless a session row exists, without constructing its runtime.
    pub async fn ensure_session_exists(&self, session_id: &str) -> RpcResult<()> {
        match self.sessions.get(session_id).await? {
            Some(_) => Ok(()),
            None => Err(RpcError::not_found(
                SessionError::NotFound(session_id.to_string()).to_string(),
            )),
        }
    }

    /// Queue a daemon event for the state manager.
    pub fn publish(&self, event: DaemonEvent) {
        if let Err(e) = self.events.emit(event) {
            tracing::debug!(error = %e, "dropping daemon event");
        }
    }
}

fn route<P, R, F, Fut>(hub: &MessageHub, ctx: &RpcContext, method: &str, handler: F) -> Unsubscribe
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(RpcContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<R>> + Send + 'static,
{
    let ctx = ctx.clone();
    hub.handle(method, move |params: P, _request: RequestContext| {
        handler(ctx.clone(), params)
    })
}

/// Register every RPC method on `hub`.
pub fn register_all(hub: &MessageHub, ctx: &RpcContext) -> Vec<Unsubscribe> {
    use handlers::*;
    use tether_protocol::channels::methods as m;

    let registrations = vec![
        // System
        route(hub, ctx, m::SYSTEM_HEALTH, system::health),
        route(hub, ctx, m::SYSTEM_CONFIG, system::config),
        route(hub, ctx, m::TEST_ECHO, system::echo),
        // State channels
        route(hub, ctx, m::SESSIONS_SNAPSHOT, state::sessions_snapshot),
        route(hub, ctx, m::SESSIONS_DELTAS, state::sessions_deltas),
        route(hub, ctx, m::SYSTEM_SNAPSHOT, state::system_snapshot),
        route(hub, ctx, m::SETTINGS_SNAPSHOT, state::settings_snapshot),
        route(hub, ctx, m::SESSION_SNAPSHOT, state::session_snapshot),
        // Sessions
        route(hub, ctx, m::SESSION_CREATE, sessions::create),
        route(hub, ctx, m::SESSION_GET, sessions::get),
        route(hub, ctx, m::SESSION_LIST, sessions::list),
        route(hub, ctx, m::SESSION_UPDATE, sessions::update),
        route(hub, ctx, m::SESSION_ARCHIVE, sessions::archive),
        route(hub, ctx, m::SESSION_DELETE, sessions::delete),
        route(hub, ctx, m::SESSION_INTERRUPT, sessions::interrupt),
        route(hub, ctx, m::CONTEXT_GET, sessions::context_get),
        route(hub, ctx, m::CONTEXT_COMPACT, sessions::context_compact),
        // Messages
        route(hub, ctx, m::MESSAGE_SEND, messages::send),
        route(hub, ctx, m::MESSAGE_LIST, messages::list),
        route(hub, ctx, m::MESSAGE_SDK_MESSAGES, messages::sdk_messages),
        route(hub, ctx, m::MESSAGE_COUNT, messages::count),
        // Rewind
        route(hub, ctx, m::REWIND_CHECKPOINTS, rewind::checkpoints),
        route(hub, ctx, m::REWIND_PREVIEW, rewind::preview),
        route(hub, ctx, m::REWIND_EXECUTE, rewind::execute),
        route(hub, ctx, m::REWIND_PREVIEW_SELECTIVE, rewind::preview_selective),
        route(hub, ctx, m::REWIND_EXECUTE_SELECTIVE, rewind::execute_selective),
        // Questions
        route(hub, ctx, m::QUESTION_RESPOND, questions::respond),
        route(hub, ctx, m::QUESTION_SAVE_DRAFT, questions::save_draft),
        route(hub, ctx, m::QUESTION_CANCEL, questions::cancel),
        // Settings
        route(hub, ctx, m::SETTINGS_GLOBAL_GET, settings::global_get),
        route(hub, ctx, m::SETTINGS_GLOBAL_UPDATE, settings::global_update),
        route(hub, ctx, m::SETTINGS_GLOBAL_SAVE, settings::global_save),
        route(hub, ctx, m::SETTINGS_MCP_TOGGLE, settings::mcp_toggle),
        route(hub, ctx, m::SETTINGS_MCP_GET_DISABLED, settings::mcp_get_disabled),
        route(hub, ctx, m::SETTINGS_MCP_SET_DISABLED, settings::mcp_set_disabled),
        route(hub, ctx, m::SETTINGS_SESSION_GET, settings::session_get),
        route(hub, ctx, m::SETTINGS_SESSION_UPDATE, settings::session_update),
        // Files
        route(hub, ctx, m::FILE_READ, files::read),
        route(hub, ctx, m::FILE_LIST, files::list),
        route(hub, ctx, m::FILE_TREE, files::tree),
        // Worktrees
        route(hub, ctx, m::WORKTREE_COMMITS_AHEAD, worktrees::commits_ahead),
        route(hub, ctx, m::WORKTREE_CLEANUP_ORPHANS, worktrees::cleanup_orphans),
        // Pairs
        route(hub, ctx, m::PAIR_CREATE, pairs::create),
        route(hub, ctx, m::PAIR_GET, pairs::get),
        route(hub, ctx, m::PAIR_GET_BY_SESSION, pairs::get_by_session),
        route(hub, ctx, m::PAIR_UPDATE_STATUS, pairs::update_status),
        route(hub, ctx, m::PAIR_LIST, pairs::list),
    ];
    tracing::info!(methods = registrations.len(), "registered RPC handlers");
    registrations
}
