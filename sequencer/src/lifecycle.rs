// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("sequencer is not running (state: {0})")]
    NotRunning(LifecycleState),
}

/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, plus
/// `Starting -> Stopped` for a failed start.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Stopped),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock()
    }

    pub fn begin_start(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Stopped, LifecycleState::Starting)
    }

    pub fn finish_start(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Starting, LifecycleState::Running)
    }

    pub fn abort_start(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Starting, LifecycleState::Stopped)
    }

    pub fn begin_stop(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Running, LifecycleState::Stopping)
    }

    pub fn finish_stop(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Stopping, LifecycleState::Stopped)
    }

    pub fn ensure_running(&self) -> Result<(), LifecycleError> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            other => Err(LifecycleError::NotRunning(other)),
        }
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleError> {
        let mut state = self.lock();
        if *state != from {
            return Err(LifecycleError::InvalidTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        // The guarded value is a plain enum; a poisoned lock still holds a valid state.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// First background task that exited on its own while the node was running.
#[derive(Debug, Clone, Default)]
pub struct TaskFailure {
    task: Arc<Mutex<Option<&'static str>>>,
}

impl TaskFailure {
    /// Keeps the first failure; later ones are already logged by their task.
    pub fn record(&self, task: &'static str) {
        let mut failed = self.lock();
        if failed.is_none() {
            *failed = Some(task);
        }
    }

    pub fn get(&self) -> Option<&'static str> {
        *self.lock()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> MutexGuard<'_, Option<&'static str>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
