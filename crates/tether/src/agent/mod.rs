//! Agent engines: the black box that actually answers prompts.

pub mod command;
pub mod engine;
pub mod scripted;

use std::sync::Arc;

pub use command::CommandEngine;
pub use engine::{AgentEngine, AgentEvent, AgentQuery, QueryControl, QueryRequest, Usage};
pub use scripted::{ScriptStep, ScriptedEngine, reply};

use crate::config::AgentConfig;

/// Engine selected by `agent.engine`: `echo` or a subprocess (the default).
pub fn build_engine(config: &AgentConfig) -> Arc<dyn AgentEngine> {
    match config.engine.as_str() {
        "echo" => Arc::new(ScriptedEngine::echo()),
        _ => Arc::new(CommandEngine::new(&config.command, config.args.clone())),
    }
}
