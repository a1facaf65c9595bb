//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           ├──► Failed
///           └──► Compensating ──┬──► Cancelled
///                               └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Steps are being executed.
    #[default]
    Running,

    /// Completed steps are being undone in reverse order.
    Compensating,

    /// All steps succeeded (terminal state).
    Completed,

    /// A compensation could not be applied; needs an operator (terminal state).
    Failed,

    /// Every executed step was compensated (terminal state).
    Cancelled,
}

impl SagaState {
    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        matches!(
            (self, next),
            (
                SagaState::Running,
                SagaState::Completed | SagaState::Failed | SagaState::Compensating
            ) | (
                SagaState::Compensating,
                SagaState::Cancelled | SagaState::Failed
            )
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::Cancelled
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Running => "Running",
            SagaState::Compensating => "Compensating",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
            SagaState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SagaState; 5] = [
        SagaState::Running,
        SagaState::Compensating,
        SagaState::Completed,
        SagaState::Failed,
        SagaState::Cancelled,
    ];

    #[test]
    fn test_default_state_is_running() {
        assert_eq!(SagaState::default(), SagaState::Running);
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(SagaState::Running.can_transition_to(SagaState::Completed));
        assert!(SagaState::Running.can_transition_to(SagaState::Failed));
        assert!(SagaState::Running.can_transition_to(SagaState::Compensating));
        assert!(SagaState::Compensating.can_transition_to(SagaState::Cancelled));
        assert!(SagaState::Compensating.can_transition_to(SagaState::Failed));

        assert!(!SagaState::Running.can_transition_to(SagaState::Cancelled));
        assert!(!SagaState::Compensating.can_transition_to(SagaState::Running));
        assert!(!SagaState::Compensating.can_transition_to(SagaState::Completed));
    }

    #[test]
    fn test_terminal_states_never_move() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(!SagaState::Running.is_terminal());
        assert!(!SagaState::Compensating.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(SagaState::Compensating.to_string(), "Compensating");
        assert_eq!(SagaState::Cancelled.to_string(), "Cancelled");
    }

    #[test]
    fn test_serialization() {
        let state = SagaState::Compensating;
        let json = serde_json::to_string(&state).unwrap();
        let deserialized: SagaState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, deserialized);
    }
}
