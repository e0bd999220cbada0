//! Bounded in-memory log of sessions-list deltas for reconnect catch-up.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tether_protocol::now_ms;
use tether_protocol::state::{DeltaCatchUp, SessionsDelta};

#[derive(Debug)]
struct LogState {
    entries: VecDeque<SessionsDelta>,
    /// Newest timestamp dropped from the front. `since` values before it
    /// cannot be served.
    floor: i64,
    last: i64,
}

#[derive(Debug)]
pub struct DeltaLog {
    capacity: usize,
    state: Mutex<LogState>,
}

impl DeltaLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LogState {
                entries: VecDeque::new(),
                floor: 0,
                last: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp `delta` with a timestamp strictly after every earlier entry and
    /// append it, evicting the oldest entry when full.
    pub fn push(&self, mut delta: SessionsDelta) -> SessionsDelta {
        let mut state = self.lock();
        delta.timestamp = delta.timestamp.max(now_ms()).max(state.last + 1);
        state.last = delta.timestamp;

        if state.entries.len() == self.capacity
            && let Some(evicted) = state.entries.pop_front()
        {
            state.floor = evicted.timestamp;
        }
        state.entries.push_back(delta.clone());
        delta
    }

    /// Deltas newer than `since`, or `resync` when some of them were evicted.
    pub fn since(&self, since: i64) -> DeltaCatchUp {
        let state = self.lock();
        let timestamp = state.last.max(now_ms());
        if since < state.floor {
            return DeltaCatchUp {
                deltas: Vec::new(),
                resync: true,
                timestamp,
            };
        }
        DeltaCatchUp {
            deltas: state
                .entries
                .iter()
                .filter(|d| d.timestamp > since)
                .cloned()
                .collect(),
            resync: false,
            timestamp,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
