//! The interactive question an agent may be waiting on.

use anyhow::{Result, bail};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tether_protocol::now_ms;
use tether_protocol::session::PendingQuestion;

#[derive(Debug)]
struct Asked {
    /// Query generation that raised the question.
    generation: u64,
    question: PendingQuestion,
}

/// At most one question is pending per session.
#[derive(Debug, Default)]
pub struct QuestionState {
    pending: Mutex<Option<Asked>>,
}

impl QuestionState {
    pub fn ask(
        &self,
        generation: u64,
        tool_use_id: &str,
        questions: Value,
        draft: Option<Value>,
    ) -> PendingQuestion {
        let question = PendingQuestion {
            tool_use_id: tool_use_id.to_string(),
            questions,
            draft,
            asked_at: now_ms(),
        };
        *self.lock() = Some(Asked {
            generation,
            question: question.clone(),
        });
        question
    }

    pub fn pending(&self) -> Option<PendingQuestion> {
        self.lock().as_ref().map(|asked| asked.question.clone())
    }

    /// Remove the pending question if it is `tool_use_id`.
    pub fn take(&self, tool_use_id: &str) -> Result<PendingQuestion> {
        let mut pending = self.lock();
        match pending.as_ref() {
            Some(asked) if asked.question.tool_use_id == tool_use_id => {}
            Some(asked) => bail!(
                "Question {tool_use_id} not found (pending question is {})",
                asked.question.tool_use_id
            ),
            None => bail!("Question {tool_use_id} not found: no question is pending"),
        }
        pending
            .take()
            .map(|asked| asked.question)
            .ok_or_else(|| anyhow::anyhow!("Question {tool_use_id} not found"))
    }

    /// Store unsubmitted answers on the pending question.
    pub fn set_draft(&self, draft: Value) -> Result<PendingQuestion> {
        let mut pending = self.lock();
        let Some(asked) = pending.as_mut() else {
            bail!("Question not found: no question is pending");
        };
        asked.question.draft = Some(draft);
        Ok(asked.question.clone())
    }

    pub fn clear(&self) -> Option<PendingQuestion> {
        self.lock().take().map(|asked| asked.question)
    }

    /// Clear the pending question only if query `generation` raised it.
    pub fn clear_for(&self, generation: u64) -> Option<PendingQuestion> {
        let mut pending = self.lock();
        if pending.as_ref().is_some_and(|asked| asked.generation == generation) {
            return pending.take().map(|asked| asked.question);
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Asked>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_take_requires_matching_id() {
        let state = QuestionState::default();
        state.ask(1, "q1", json!([{"question": "A or B?"}]), None);

        assert!(state.take("q2").is_err());
        assert!(state.pending().is_some());

        let draft = state.set_draft(json!({"0": "A"})).unwrap();
        assert_eq!(draft.draft, Some(json!({"0": "A"})));

        let taken = state.take("q1").unwrap();
        assert_eq!(taken.tool_use_id, "q1");
        assert!(state.pending().is_none());
        assert!(state.set_draft(json!({})).is_err());
    }

    #[test]
    fn test_clear_for_only_removes_own_generation() {
        let state = QuestionState::default();
        state.ask(2, "q-new", json!([]), None);

        assert!(state.clear_for(1).is_none());
        assert_eq!(state.pending().unwrap().tool_use_id, "q-new");

        assert_eq!(state.clear_for(2).unwrap().tool_use_id, "q-new");
        assert!(state.pending().is_none());
    }
}
