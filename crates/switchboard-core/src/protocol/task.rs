use super::artifact::Artifact;
use super::message::Message;
use crate::ids::{ContextId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle state.
///
/// ```text
/// submitted ─► working ─┬─► completed
///     │          ▲  │   ├─► failed
///     │          │  │   └─► canceled
///     │          │  ▼
///     │      input_required ─► canceled
///     └──────────────────────► canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, not yet executing
    Submitted,
    /// Resolution logic is running
    Working,
    /// Paused until the caller supplies more information
    InputRequired,
    /// Finished with an answer
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the caller
    Canceled,
}

impl TaskState {
    /// No transition leaves a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Terminal or waiting on the caller; ends the current event stream.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.is_terminal() || matches!(self, Self::InputRequired)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Submitted, Working)
                | (Submitted, Canceled)
                | (Working, Completed)
                | (Working, Failed)
                | (Working, InputRequired)
                | (Working, Canceled)
                | (InputRequired, Working)
                | (InputRequired, Canceled)
        )
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input_required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus the message that accompanied the transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Current state
    pub state: TaskState,
    /// Final answer, question or failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// When the state was entered
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    /// Status entered now
    pub fn new(state: TaskState, message: Option<Message>) -> Self {
        Self {
            state,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Snapshot of a task as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub id: TaskId,
    /// Owning context
    pub context_id: ContextId,
    /// Current status
    pub status: TaskStatus,
    /// Artifacts in creation order
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Caller and agent messages in order
    #[serde(default)]
    pub history: Vec<Message>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskState; 6] = [
        TaskState::Submitted,
        TaskState::Working,
        TaskState::InputRequired,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Canceled,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_cancel_legal_from_live_states() {
        for from in [
            TaskState::Submitted,
            TaskState::Working,
            TaskState::InputRequired,
        ] {
            assert!(from.can_transition_to(TaskState::Canceled));
        }
    }

    #[test]
    fn test_input_required_resumes_to_working() {
        assert!(TaskState::InputRequired.can_transition_to(TaskState::Working));
        assert!(!TaskState::InputRequired.can_transition_to(TaskState::Completed));
        assert!(TaskState::InputRequired.is_final());
        assert!(!TaskState::InputRequired.is_terminal());
    }

    #[test]
    fn test_submitted_cannot_skip_working() {
        assert!(!TaskState::Submitted.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Submitted.can_transition_to(TaskState::Failed));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskState::InputRequired).unwrap(),
            "\"input_required\""
        );
        for state in ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }
}
