//! Process-wide registry of active call sessions.
//!
//! The only structure mutated from multiple call workers concurrently.
//! Entries are created on stream start and removed when teardown
//! completes, so a racing create for an id mid-teardown is rejected as a
//! duplicate rather than guessed at.

use crate::turn::{CallState, TurnController};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("call {0} is already active")]
    DuplicateCallId(String),

    #[error("at capacity ({0} concurrent calls)")]
    AtCapacity(usize),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// The registry-owned record of one active call. The worker loop owns the
/// channel endpoints and transducer handles; this record carries the
/// shared, observable parts.
#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    created_at: Instant,
    turn: Mutex<TurnController>,
}

impl CallSession {
    fn new(call_id: String) -> Self {
        Self { call_id, created_at: Instant::now(), turn: Mutex::new(TurnController::new()) }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// The turn controller; the call's own worker is the only mutator.
    pub fn turn(&self) -> &Mutex<TurnController> {
        &self.turn
    }

    pub async fn state(&self) -> CallState {
        self.turn.lock().await.state()
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<CallSession>>,
    max_calls: usize,
}

impl SessionRegistry {
    pub fn new(max_calls: usize) -> Self {
        Self { sessions: DashMap::new(), max_calls }
    }

    /// Register a new call. Fails if the id is already active (including
    /// mid-teardown) or the process is at its concurrent-call ceiling.
    pub fn create(&self, call_id: &str) -> Result<Arc<CallSession>> {
        if self.sessions.len() >= self.max_calls {
            warn!(call_id, max = self.max_calls, "rejecting call: at capacity");
            return Err(RegistryError::AtCapacity(self.max_calls));
        }
        match self.sessions.entry(call_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateCallId(call_id.to_string())),
            Entry::Vacant(slot) => {
                let session = Arc::new(CallSession::new(call_id.to_string()));
                slot.insert(session.clone());
                info!(call_id, active = self.sessions.len(), "call registered");
                Ok(session)
            }
        }
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.get(call_id).map(|entry| entry.clone())
    }

    /// Remove a call's entry. A second remove for the same id is a no-op.
    pub fn remove(&self, call_id: &str) {
        if self.sessions.remove(call_id).is_some() {
            info!(call_id, active = self.sessions.len(), "call removed");
        }
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }
}
