//! Lifecycle of one plugin-backed backend instance, as seen by the host.
//!
//! ```text
//!   Unspawned → Spawned → SetupComplete → Initialized → Serving → CleaningUp → Terminated
//!                  ↑                                       │           │
//!                  └───────── rebuild after a crash ───────┘           │
//!                  └───────────────── reload ──────────────────────────┘
//! ```
//!
//! Requests are accepted in `Initialized` and `Serving`; those are also the
//! only states in which the host answers the plugin's storage calls.

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Unspawned,
    Spawned,
    SetupComplete,
    Initialized,
    Serving,
    CleaningUp,
    Terminated,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspawned => "unspawned",
            Self::Spawned => "spawned",
            Self::SetupComplete => "setup-complete",
            Self::Initialized => "initialized",
            Self::Serving => "serving",
            Self::CleaningUp => "cleaning-up",
            Self::Terminated => "terminated",
        }
    }

    pub fn accepts_requests(self) -> bool {
        matches!(self, Self::Initialized | Self::Serving)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransitionError {
    pub from: InstanceState,
    pub to: InstanceState,
    pub reason: String,
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid instance transition from {} to {}: {}", self.from, self.to, self.reason)
    }
}

impl std::error::Error for StateTransitionError {}

/// Pure transition rules.
pub struct InstanceStateMachine;

impl InstanceStateMachine {
    pub fn validate_transition(from: InstanceState, to: InstanceState) -> Result<(), StateTransitionError> {
        use InstanceState::*;

        let reason = match (from, to) {
            (current, next) if current == next => return Ok(()),
            (Terminated, _) => "terminated instances cannot be revived",

            (Unspawned, Spawned) => return Ok(()),
            (Spawned, SetupComplete) => return Ok(()),
            (SetupComplete, Initialized) => return Ok(()),
            (Initialized, Serving) => return Ok(()),

            // Canary-guarded rebuild after a crash.
            (Serving, Spawned) | (Initialized, Spawned) => return Ok(()),

            // Cleanup may start from any live state.
            (Spawned | SetupComplete | Initialized | Serving, CleaningUp) => return Ok(()),
            (CleaningUp, Terminated) => return Ok(()),
            // Reload keeps the instance and respawns the process.
            (CleaningUp, Spawned) => return Ok(()),

            // A process that never got set up can simply go away.
            (Unspawned | Spawned, Terminated) => return Ok(()),

            (Unspawned, _) => "the plugin process has not been spawned",
            (Spawned, _) => "setup has not completed",
            (SetupComplete, Serving) => "initialize has not run",
            (CleaningUp, _) => "cleanup is in progress",
            _ => "backward transition",
        };
        Err(StateTransitionError {
            from,
            to,
            reason: reason.to_string(),
        })
    }
}

/// Shared, validated state of one instance.
#[derive(Debug)]
pub struct StateTracker {
    name: String,
    state: Mutex<InstanceState>,
}

impl StateTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(InstanceState::Unspawned),
        }
    }

    pub fn current(&self) -> InstanceState {
        *self.state.lock()
    }

    pub fn transition(&self, to: InstanceState) -> Result<InstanceState, StateTransitionError> {
        let mut state = self.state.lock();
        let from = *state;
        InstanceStateMachine::validate_transition(from, to)?;
        if from != to {
            trace!(instance = %self.name, %from, %to, "instance state change");
        }
        *state = to;
        Ok(from)
    }

    /// Apply `to` if it is valid from the current state; otherwise leave
    /// the state alone. Returns whether the state changed.
    pub fn advance(&self, to: InstanceState) -> bool {
        self.transition(to).is_ok_and(|from| from != to)
    }
}

#[cfg(test)]
mod tests {
    use super::InstanceState::*;
    use super::*;

    #[test]
    fn test_happy_path() {
        let tracker = StateTracker::new("kv");
        for next in [Spawned, SetupComplete, Initialized, Serving, CleaningUp, Terminated] {
            tracker.transition(next).unwrap();
        }
        assert_eq!(tracker.current(), Terminated);
    }

    #[test]
    fn test_rebuild_and_reload() {
        assert!(InstanceStateMachine::validate_transition(Serving, Spawned).is_ok());
        assert!(InstanceStateMachine::validate_transition(CleaningUp, Spawned).is_ok());
        assert!(InstanceStateMachine::validate_transition(Terminated, Spawned).is_err());
    }

    #[test]
    fn test_requests_need_initialize() {
        assert!(!SetupComplete.accepts_requests());
        assert!(Initialized.accepts_requests());
        assert!(Serving.accepts_requests());
        let err = InstanceStateMachine::validate_transition(SetupComplete, Serving).unwrap_err();
        assert_eq!(err.reason, "initialize has not run");
        assert!(InstanceStateMachine::validate_transition(Unspawned, Initialized).is_err());
    }

    #[test]
    fn test_advance_ignores_invalid() {
        let tracker = StateTracker::new("kv");
        assert!(!tracker.advance(Serving));
        assert_eq!(tracker.current(), Unspawned);
        assert!(tracker.advance(Spawned));
        assert!(!tracker.advance(Spawned));
    }
}
