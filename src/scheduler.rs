//! Bounded registry of running tasks keyed by session id.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("agent at max capacity")]
    AtCapacity,
    #[error("session {0} already active")]
    Duplicate(String),
}

/// Admission control plus the active set. The map is the only record of
/// what is running; every read and write goes through the lock.
pub struct Scheduler {
    capacity: usize,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a slot for `session_id`. The returned token is cancelled by
    /// [`Scheduler::stop`]; the worker watches it and kills its child.
    pub async fn admit(&self, session_id: &str) -> Result<CancellationToken, AdmitError> {
        let mut active = self.active.lock().await;
        if active.contains_key(session_id) {
            return Err(AdmitError::Duplicate(session_id.to_string()));
        }
        if active.len() >= self.capacity {
            return Err(AdmitError::AtCapacity);
        }
        let token = CancellationToken::new();
        active.insert(session_id.to_string(), token.clone());
        Ok(token)
    }

    /// Signal cancellation. Unknown sessions are ignored.
    pub async fn stop(&self, session_id: &str) -> bool {
        match self.active.lock().await.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Release the slot. Called by the worker before it reports completion.
    pub async fn finish(&self, session_id: &str) {
        self.active.lock().await.remove(session_id);
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().await.contains_key(session_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Fraction of capacity in use, in `[0, 1]`.
    pub async fn load(&self) -> f64 {
        let active = self.active_count().await;
        load_factor(active, self.capacity)
    }
}

pub fn load_factor(active: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        return 1.0;
    }
    (active as f64 / capacity as f64).min(1.0)
}
