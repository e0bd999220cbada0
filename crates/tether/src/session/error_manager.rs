//! Bounded history of query failures for one session.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tether_protocol::now_ms;

const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedError {
    pub message: String,
    pub category: String,
    pub timestamp: i64,
}

/// Coarse bucket of an error message, shown to the user alongside it.
pub fn categorize(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded") {
        "rate_limit"
    } else if lower.contains("auth") || lower.contains("api key") || lower.contains("401") {
        "auth"
    } else if lower.contains("timed out") || lower.contains("connection") || lower.contains("network") {
        "network"
    } else if lower.contains("spawn") || lower.contains("exited") {
        "process"
    } else {
        "unknown"
    }
}

#[derive(Debug)]
pub struct ErrorManager {
    capacity: usize,
    errors: Mutex<VecDeque<RecordedError>>,
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ErrorManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, message: &str) -> RecordedError {
        let recorded = RecordedError {
            message: message.to_string(),
            category: categorize(message).to_string(),
            timestamp: now_ms(),
        };
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        if errors.len() == self.capacity {
            errors.pop_front();
        }
        errors.push_back(recorded.clone());
        recorded
    }

    pub fn last(&self) -> Option<RecordedError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<RecordedError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
