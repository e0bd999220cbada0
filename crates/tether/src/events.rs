//! Events exchanged between daemon components over the in-process hub.

use serde_json::Value;
use tether_protocol::channels::GLOBAL_CHANNEL;
use tether_protocol::session::{
    ContextInfo, PendingQuestion, ProcessingStatus, Session, StoredMessage,
};

use crate::hub::HubEvent;

/// Discriminant of [`DaemonEvent`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonEventKind {
    SessionCreated,
    SessionUpdated,
    SessionDeleted,
    StatusChanged,
    MessagePersisted,
    StreamDelta,
    ContextUpdated,
    QuestionAsked,
    QuestionDraftUpdated,
    QuestionResolved,
    SessionError,
    SettingsUpdated,
}

/// Every event names the session it concerns; settings changes use the
/// session id or `global` as their scope.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        session_id: String,
    },
    StatusChanged {
        session_id: String,
        status: ProcessingStatus,
        generation: u64,
    },
    MessagePersisted {
        session_id: String,
        message: StoredMessage,
    },
    StreamDelta {
        session_id: String,
        generation: u64,
        text: String,
    },
    ContextUpdated {
        session_id: String,
        context: ContextInfo,
    },
    QuestionAsked {
        session_id: String,
        question: PendingQuestion,
    },
    QuestionDraftUpdated {
        session_id: String,
        draft: Value,
    },
    QuestionResolved {
        session_id: String,
        tool_use_id: String,
        cancelled: bool,
    },
    SessionError {
        session_id: String,
        message: String,
        category: String,
    },
    SettingsUpdated {
        scope: String,
        settings: Value,
    },
}

impl DaemonEvent {
    pub fn global_settings(settings: Value) -> Self {
        DaemonEvent::SettingsUpdated {
            scope: GLOBAL_CHANNEL.to_string(),
            settings,
        }
    }
}

impl HubEvent for DaemonEvent {
    type Kind = DaemonEventKind;

    fn kind(&self) -> DaemonEventKind {
        match self {
            DaemonEvent::SessionCreated { .. } => DaemonEventKind::SessionCreated,
            DaemonEvent::SessionUpdated { .. } => DaemonEventKind::SessionUpdated,
            DaemonEvent::SessionDeleted { .. } => DaemonEventKind::SessionDeleted,
            DaemonEvent::StatusChanged { .. } => DaemonEventKind::StatusChanged,
            DaemonEvent::MessagePersisted { .. } => DaemonEventKind::MessagePersisted,
            DaemonEvent::StreamDelta { .. } => DaemonEventKind::StreamDelta,
            DaemonEvent::ContextUpdated { .. } => DaemonEventKind::ContextUpdated,
            DaemonEvent::QuestionAsked { .. } => DaemonEventKind::QuestionAsked,
            DaemonEvent::QuestionDraftUpdated { .. } => DaemonEventKind::QuestionDraftUpdated,
            DaemonEvent::QuestionResolved { .. } => DaemonEventKind::QuestionResolved,
            DaemonEvent::SessionError { .. } => DaemonEventKind::SessionError,
            DaemonEvent::SettingsUpdated { .. } => DaemonEventKind::SettingsUpdated,
        }
    }

    fn session_id(&self) -> &str {
        match self {
            DaemonEvent::SessionCreated { session } | DaemonEvent::SessionUpdated { session } => {
                &session.id
            }
            DaemonEvent::SessionDeleted { session_id }
            | DaemonEvent::StatusChanged { session_id, .. }
            | DaemonEvent::MessagePersisted { session_id, .. }
            | DaemonEvent::StreamDelta { session_id, .. }
            | DaemonEvent::ContextUpdated { session_id, .. }
            | DaemonEvent::QuestionAsked { session_id, .. }
            | DaemonEvent::QuestionDraftUpdated { session_id, .. }
            | DaemonEvent::QuestionResolved { session_id, .. }
            | DaemonEvent::SessionError { session_id, .. } => session_id,
            DaemonEvent::SettingsUpdated { scope, .. } => scope,
        }
    }
}
