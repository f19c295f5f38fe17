//! Operation lifecycle
//!
//! ```text
//! Received ──► Validated ──► Locked ──► Committed
//!     │            │  │        │  ▲        ▲
//!     ▼            ▼  │        │  └── retry on conflict
//!  Rejected     Rejected       ▼             │
//!                     │     Aborted          │
//!                     └──── replayed ────────┘
//! ```

use crate::types::IdempotencyKey;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Received,
    Validated,
    Locked,
    Committed,
    Rejected,
    Aborted,
}

impl OperationState {
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, Locked)
                | (Validated, Rejected)
                | (Locked, Locked)
                | (Locked, Committed)
                | (Locked, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Committed | OperationState::Rejected | OperationState::Aborted
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Received => "received",
            OperationState::Validated => "validated",
            OperationState::Locked => "locked",
            OperationState::Committed => "committed",
            OperationState::Rejected => "rejected",
            OperationState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Traced state of one in-flight operation
#[derive(Debug)]
pub(crate) struct Lifecycle {
    key: IdempotencyKey,
    state: OperationState,
}

impl Lifecycle {
    pub(crate) fn new(key: &IdempotencyKey) -> Self {
        tracing::trace!(key = %key, state = %OperationState::Received, "Operation received");
        Self {
            key: key.clone(),
            state: OperationState::Received,
        }
    }

    pub(crate) fn state(&self) -> OperationState {
        self.state
    }

    /// Move to `next`, tracing the transition
    ///
    /// An illegal transition is a bug in the engine; it is logged and the
    /// state is left untouched.
    pub(crate) fn advance(&mut self, next: OperationState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                key = %self.key,
                from = %self.state,
                to = %next,
                "Illegal operation state transition"
            );
            debug_assert!(false, "illegal transition {} -> {}", self.state, next);
            return;
        }
        tracing::debug!(key = %self.key, from = %self.state, to = %next, "Operation state");
        self.state = next;
    }

    /// Settle an operation answered from an earlier commit of its scope
    ///
    /// Only legal straight after validation; the replay takes no locks.
    pub(crate) fn replayed(&mut self) {
        if self.state != OperationState::Validated {
            tracing::error!(key = %self.key, from = %self.state, "Illegal operation replay");
            debug_assert!(false, "illegal replay from {}", self.state);
            return;
        }
        tracing::debug!(
            key = %self.key,
            from = %self.state,
            to = %OperationState::Committed,
            replayed = true,
            "Operation state"
        );
        self.state = OperationState::Committed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use OperationState::*;

    #[rstest]
    #[case::validate(Received, Validated, true)]
    #[case::reject_early(Received, Rejected, true)]
    #[case::reject_validated(Validated, Rejected, true)]
    #[case::lock(Validated, Locked, true)]
    #[case::retry(Locked, Locked, true)]
    #[case::commit(Locked, Committed, true)]
    #[case::abort(Locked, Aborted, true)]
    #[case::skip_validation(Received, Locked, false)]
    #[case::reject_after_lock(Locked, Rejected, false)]
    #[case::leave_committed(Committed, Locked, false)]
    #[case::abort_unlocked(Validated, Aborted, false)]
    fn test_transitions(
        #[case] from: OperationState,
        #[case] to: OperationState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(Committed.is_terminal());
        assert!(Rejected.is_terminal());
        assert!(Aborted.is_terminal());
        assert!(!Locked.is_terminal());
    }

    #[test]
    fn test_lifecycle_follows_happy_path() {
        let mut lifecycle = Lifecycle::new(&IdempotencyKey::new("k"));
        lifecycle.advance(Validated);
        lifecycle.advance(Locked);
        lifecycle.advance(Locked);
        lifecycle.advance(Committed);
        assert_eq!(lifecycle.state(), Committed);
    }

    #[test]
    fn test_replay_ends_in_committed() {
        let mut lifecycle = Lifecycle::new(&IdempotencyKey::new("k"));
        lifecycle.advance(Validated);
        lifecycle.replayed();
        assert_eq!(lifecycle.state(), Committed);
        assert!(lifecycle.state().is_terminal());
    }
}
