//! Canonical task lifecycle states and the transitions permitted between
//! them.

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Canonical task lifecycle state. Mapping from a back-end's native status
/// string is the back-end's job; an unrecognized native status must yield
/// [`TaskState::Unknown`], never an invented mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Constructed, never submitted.
    New,
    /// Accepted by the scheduler, not yet observed running (queued /
    /// staging / preparing).
    Submitted,
    /// Observed executing on the remote side, inclusive of epilogue stages
    /// (finishing, output-staging) where the scheduler still reports
    /// activity.
    Running,
    /// User-held or admin-suspended on the remote side.
    Stopped,
    /// Remote execution is over but outputs have not yet been fetched down.
    Terminating,
    /// Outputs fetched (or fetch explicitly declined), exit status
    /// finalized. Terminal.
    Terminated,
    /// The scheduler cannot presently answer questions about the job; a
    /// transient condition that must be retried.
    Unknown,
}

impl TaskState {
    /// Whether `next` is a permitted transition from `self`.
    ///
    /// `New -> Submitted`; `Submitted <-> Running`; from `Submitted`,
    /// `Running`, `Stopped` to `Terminating` or `Unknown`;
    /// `Terminating -> Terminated`; `Unknown -> any`. Cancellation moves
    /// directly to `Terminated` from any non-terminal state (modeled as a
    /// dedicated allowance below, matching `Cancel`'s semantics rather than
    /// `UpdateState`'s).
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (New, Submitted) => true,
            (Submitted, Running) | (Running, Submitted) => true,
            (Submitted | Running | Stopped, Terminating | Unknown) => true,
            (Terminating, Terminated) => true,
            (Unknown, _) => true,
            (_, Terminated) => true, // Cancel's direct-to-Terminated path.
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Terminated)
    }
}

/// Attempt to move `state` to `next`, rejecting illegal transitions rather
/// than letting a back-end silently wedge a task in an impossible state.
pub fn transition(state: &mut TaskState, next: TaskState) -> Result<(), OrchestratorError> {
    if !state.can_transition_to(next) {
        return Err(OrchestratorError::Internal(format!(
            "illegal task state transition: {state:?} -> {next:?}"
        )));
    }
    *state = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_to_submitted_allowed() {
        assert!(TaskState::New.can_transition_to(TaskState::Submitted));
    }

    #[test]
    fn new_to_running_rejected() {
        assert!(!TaskState::New.can_transition_to(TaskState::Running));
        let mut s = TaskState::New;
        assert!(transition(&mut s, TaskState::Running).is_err());
        assert_eq!(s, TaskState::New);
    }

    #[test]
    fn unknown_permits_any_recovery() {
        assert!(TaskState::Unknown.can_transition_to(TaskState::Running));
        assert!(TaskState::Unknown.can_transition_to(TaskState::Terminated));
    }

    #[test]
    fn cancel_reaches_terminated_from_running() {
        let mut s = TaskState::Running;
        assert!(transition(&mut s, TaskState::Terminated).is_ok());
        assert_eq!(s, TaskState::Terminated);
    }

    #[test]
    fn terminating_requires_terminated_next() {
        assert!(TaskState::Terminating.can_transition_to(TaskState::Terminated));
        assert!(!TaskState::Terminating.can_transition_to(TaskState::Running));
    }
}
