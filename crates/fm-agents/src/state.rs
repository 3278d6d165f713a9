use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Thinking,
    ExecutingTool,
    Responding,
    WaitingApproval,
    Error,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::Thinking => "thinking",
            RunState::ExecutingTool => "executing_tool",
            RunState::Responding => "responding",
            RunState::WaitingApproval => "waiting_approval",
            RunState::Error => "error",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

// ---------------------------------------------------------------------------
// RunStateMachine
// ---------------------------------------------------------------------------

/// Tracks the run loop's position in its state machine and rejects
/// transitions the loop should never make.
///
/// Valid transitions:
/// - Idle          -> Thinking
/// - Thinking      -> ExecutingTool | Responding | Error
/// - ExecutingTool -> Thinking | WaitingApproval | Error
/// - Responding    -> Idle
///
/// `WaitingApproval` and `Error` are terminal for a single run; the machine
/// is discarded with the run.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunState,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.current
    }

    /// Move to `next`, or report the attempted illegal transition.
    pub fn advance(&mut self, next: RunState) -> Result<RunState, StateError> {
        let valid = matches!(
            (self.current, next),
            (RunState::Idle, RunState::Thinking)
                | (RunState::Thinking, RunState::ExecutingTool)
                | (RunState::Thinking, RunState::Responding)
                | (RunState::Thinking, RunState::Error)
                | (RunState::ExecutingTool, RunState::Thinking)
                | (RunState::ExecutingTool, RunState::WaitingApproval)
                | (RunState::ExecutingTool, RunState::Error)
                | (RunState::Responding, RunState::Idle)
        );
        if !valid {
            return Err(StateError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        let from = self.current;
        self.current = next;
        tracing::debug!(from = %from, to = %next, "run state transition");
        Ok(next)
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_through_responding() {
        let mut sm = RunStateMachine::new();
        sm.advance(RunState::Thinking).unwrap();
        sm.advance(RunState::ExecutingTool).unwrap();
        sm.advance(RunState::Thinking).unwrap();
        sm.advance(RunState::Responding).unwrap();
        sm.advance(RunState::Idle).unwrap();
        assert_eq!(sm.state(), RunState::Idle);
    }

    #[test]
    fn approval_pause_is_terminal() {
        let mut sm = RunStateMachine::new();
        sm.advance(RunState::Thinking).unwrap();
        sm.advance(RunState::ExecutingTool).unwrap();
        sm.advance(RunState::WaitingApproval).unwrap();
        assert!(sm.advance(RunState::Thinking).is_err());
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut sm = RunStateMachine::new();
        assert!(sm.advance(RunState::Responding).is_err());
        assert!(sm.advance(RunState::ExecutingTool).is_err());
        assert_eq!(sm.state(), RunState::Idle);
    }
}
