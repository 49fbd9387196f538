//! Observable runtime state.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity for the state broadcast channel.
/// A lagging observer only misses intermediate transitions; `get()` is
/// always current.
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of the interpreter as seen by observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeState {
    /// Bootstrap in progress.
    pub loading: bool,
    /// Runtime ready for execution.
    pub ready: bool,
    /// Last initialization or transport failure.
    pub error: Option<String>,
}

impl RuntimeState {
    /// Bootstrap in progress.
    pub fn loading() -> Self {
        Self {
            loading: true,
            ..Self::default()
        }
    }

    /// Bootstrap finished.
    pub fn ready() -> Self {
        Self {
            ready: true,
            ..Self::default()
        }
    }

    /// Bootstrap or worker failed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Current [`RuntimeState`] plus a channel publishing every transition.
pub struct RuntimeStateStore {
    current: Mutex<RuntimeState>,
    tx: broadcast::Sender<RuntimeState>,
}

impl RuntimeStateStore {
    /// Create a store in the initial state.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(RuntimeState::default()),
            tx,
        }
    }

    /// Snapshot of the current state.
    pub fn get(&self) -> RuntimeState {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the state and publish it, ignoring send failures.
    pub fn set(&self, state: RuntimeState) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = state.clone();
        // Published under the lock so observers see transitions in order.
        let _ = self.tx.send(state);
    }

    /// Receive every subsequent transition.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeState> {
        self.tx.subscribe()
    }
}

impl Default for RuntimeStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeStateStore")
            .field("current", &self.get())
            .finish()
    }
}
