use super::artifact::ArtifactChunk;
use super::task::{TaskState, TaskStatus};
use crate::ids::{ContextId, TaskId};
use serde::{Deserialize, Serialize};

/// Status transition or note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdateEvent {
    /// Task identifier
    pub task_id: TaskId,
    /// Context identifier
    pub context_id: ContextId,
    /// Per-task logical time, starting at 1
    pub seq: u64,
    /// New status
    pub status: TaskStatus,
    /// Last event of the current stream
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// One artifact chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskArtifactUpdateEvent {
    /// Task identifier
    pub task_id: TaskId,
    /// Context identifier
    pub context_id: ContextId,
    /// Per-task logical time, starting at 1
    pub seq: u64,
    /// The chunk
    pub artifact: ArtifactChunk,
}

/// Event delivered to subscribers of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskEvent {
    /// `status-update`
    StatusUpdate(TaskStatusUpdateEvent),
    /// `artifact-update`
    ArtifactUpdate(TaskArtifactUpdateEvent),
}

impl TaskEvent {
    /// Task the event belongs to
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::StatusUpdate(e) => e.task_id,
            Self::ArtifactUpdate(e) => e.task_id,
        }
    }

    /// Context the event belongs to
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        match self {
            Self::StatusUpdate(e) => e.context_id,
            Self::ArtifactUpdate(e) => e.context_id,
        }
    }

    /// Logical time within the task
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Self::StatusUpdate(e) => e.seq,
            Self::ArtifactUpdate(e) => e.seq,
        }
    }

    /// Whether this event ends the current stream
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::StatusUpdate(e) if e.is_final)
    }

    /// State carried by a status update
    #[must_use]
    pub fn state(&self) -> Option<TaskState> {
        match self {
            Self::StatusUpdate(e) => Some(e.status.state),
            Self::ArtifactUpdate(_) => None,
        }
    }
}
