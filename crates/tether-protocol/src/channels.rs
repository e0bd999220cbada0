//! Channel, event and method names.

/// Channel every connection joins on connect.
pub const GLOBAL_CHANNEL: &str = "global";

/// Prefix of per-session channels.
pub const SESSION_CHANNEL_PREFIX: &str = "session:";

/// Per-session broadcast channel name.
pub fn session_channel(session_id: &str) -> String {
    format!("{SESSION_CHANNEL_PREFIX}{session_id}")
}

/// Session id encoded in a per-session channel name.
pub fn session_id_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(SESSION_CHANNEL_PREFIX)
}

/// Event names.
pub mod events {
    pub const SESSIONS: &str = "state.sessions";
    pub const SESSIONS_DELTA: &str = "state.sessions.delta";
    pub const SYSTEM: &str = "state.system";
    pub const SETTINGS: &str = "state.settings";
    pub const SESSION: &str = "state.session";
    pub const MESSAGES_DELTA: &str = "state.messages.delta";
    pub const CONTEXT_UPDATED: &str = "context.updated";
    pub const SESSION_STATUS: &str = "session.status";
    pub const SESSION_ERROR: &str = "session.error";
    pub const STREAM_DELTA: &str = "stream.delta";
    pub const QUESTION_ASKED: &str = "question.asked";
    pub const QUESTION_DRAFT: &str = "question.draftUpdated";
    pub const QUESTION_RESOLVED: &str = "question.resolved";
    pub const SETTINGS_UPDATED: &str = "settings.updated";
    pub const SESSIONS_FILTER_CHANGED: &str = "sessions.filterChanged";
    pub const TEST_ECHO: &str = "test.echo";
}

/// RPC method names.
pub mod methods {
    pub const CHANNEL_JOIN: &str = "channel.join";
    pub const CHANNEL_LEAVE: &str = "channel.leave";

    pub const SYSTEM_HEALTH: &str = "system.health";
    pub const SYSTEM_CONFIG: &str = "system.config";
    pub const TEST_ECHO: &str = "test.echo";

    pub const SESSIONS_SNAPSHOT: &str = "state.sessions.snapshot";
    pub const SESSIONS_DELTAS: &str = "state.sessions.deltas";
    pub const SYSTEM_SNAPSHOT: &str = "state.system.snapshot";
    pub const SETTINGS_SNAPSHOT: &str = "state.settings.snapshot";
    pub const SESSION_SNAPSHOT: &str = "state.session.snapshot";

    pub const SESSION_CREATE: &str = "session.create";
    pub const SESSION_GET: &str = "session.get";
    pub const SESSION_LIST: &str = "session.list";
    pub const SESSION_UPDATE: &str = "session.update";
    pub const SESSION_ARCHIVE: &str = "session.archive";
    pub const SESSION_DELETE: &str = "session.delete";
    pub const SESSION_INTERRUPT: &str = "session.interrupt";

    pub const MESSAGE_SEND: &str = "message.send";
    pub const MESSAGE_LIST: &str = "message.list";
    pub const MESSAGE_SDK_MESSAGES: &str = "message.sdkMessages";
    pub const MESSAGE_COUNT: &str = "message.count";

    pub const CONTEXT_GET: &str = "context.get";
    pub const CONTEXT_COMPACT: &str = "context.compact";

    pub const REWIND_CHECKPOINTS: &str = "rewind.checkpoints";
    pub const REWIND_PREVIEW: &str = "rewind.preview";
    pub const REWIND_EXECUTE: &str = "rewind.execute";
    pub const REWIND_PREVIEW_SELECTIVE: &str = "rewind.previewSelective";
    pub const REWIND_EXECUTE_SELECTIVE: &str = "rewind.executeSelective";

    pub const QUESTION_RESPOND: &str = "question.respond";
    pub const QUESTION_SAVE_DRAFT: &str = "question.saveDraft";
    pub const QUESTION_CANCEL: &str = "question.cancel";

    pub const SETTINGS_GLOBAL_GET: &str = "settings.global.get";
    pub const SETTINGS_GLOBAL_UPDATE: &str = "settings.global.update";
    pub const SETTINGS_GLOBAL_SAVE: &str = "settings.global.save";
    pub const SETTINGS_MCP_TOGGLE: &str = "settings.mcp.toggle";
    pub const SETTINGS_MCP_GET_DISABLED: &str = "settings.mcp.getDisabled";
    pub const SETTINGS_MCP_SET_DISABLED: &str = "settings.mcp.setDisabled";
    pub const SETTINGS_SESSION_GET: &str = "settings.session.get";
    pub const SETTINGS_SESSION_UPDATE: &str = "settings.session.update";

    pub const FILE_READ: &str = "file.read";
    pub const FILE_LIST: &str = "file.list";
    pub const FILE_TREE: &str = "file.tree";

    pub const WORKTREE_COMMITS_AHEAD: &str = "worktree.commitsAhead";
    pub const WORKTREE_CLEANUP_ORPHANS: &str = "worktree.cleanupOrphans";

    pub const PAIR_CREATE: &str = "pair.create";
    pub const PAIR_GET: &str = "pair.get";
    pub const PAIR_GET_BY_SESSION: &str = "pair.getBySession";
    pub const PAIR_UPDATE_STATUS: &str = "pair.updateStatus";
    pub const PAIR_LIST: &str = "pair.list";
}
