use super::message::Message;
use crate::error::Error;
use crate::ids::{ContextId, TaskId};
use serde::{Deserialize, Serialize};

/// Send a message, opening or continuing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Context the message belongs to
    pub context_id: ContextId,
    /// Existing task to continue; absent for a new task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// The message
    pub message: Message,
}

/// Cancel a task. Idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    /// Task to cancel
    pub task_id: TaskId,
}

/// Error category carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Context or task never created by the agent
    UnknownContext,
    /// Task is terminal
    TaskClosed,
    /// Request was malformed or illegal
    InvalidRequest,
    /// Anything else
    Internal,
}

/// Error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Context carried by the failed request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    /// Task referenced by the failed request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// `{"error": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error
    pub error: ErrorBody,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        let (kind, context_id, task_id) = match error {
            Error::UnknownContext {
                context_id,
                task_id,
            } => (ErrorKind::UnknownContext, Some(*context_id), *task_id),
            Error::UnknownTask(task_id) => (ErrorKind::UnknownContext, None, Some(*task_id)),
            Error::TaskClosed { task_id, .. } => (ErrorKind::TaskClosed, None, Some(*task_id)),
            Error::InvalidTransition { .. } | Error::Artifact(_) | Error::Protocol(_) => {
                (ErrorKind::InvalidRequest, None, None)
            }
            _ => (ErrorKind::Internal, None, None),
        };
        Self {
            kind,
            message: error.to_string(),
            context_id,
            task_id,
        }
    }
}

impl ErrorBody {
    /// Rebuild a typed error on the calling side.
    #[must_use]
    pub fn into_error(self) -> Error {
        match (self.kind, self.context_id, self.task_id) {
            (ErrorKind::UnknownContext, Some(context_id), task_id) => Error::UnknownContext {
                context_id,
                task_id,
            },
            (ErrorKind::UnknownContext, None, Some(task_id)) => Error::UnknownTask(task_id),
            _ => Error::Protocol(self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_context_roundtrip() {
        let context_id = ContextId::new();
        let task_id = TaskId::new();
        let err = Error::UnknownContext {
            context_id,
            task_id: Some(task_id),
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, ErrorKind::UnknownContext);

        let json = serde_json::to_string(&ErrorEnvelope { error: body }).unwrap();
        let parsed: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        match parsed.error.into_error() {
            Error::UnknownContext {
                context_id: c,
                task_id: t,
            } => {
                assert_eq!(c, context_id);
                assert_eq!(t, Some(task_id));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_request_omits_absent_task() {
        let req = SendMessageRequest {
            context_id: ContextId::new(),
            task_id: None,
            message: Message::caller_text("hi"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("task_id").is_none());
    }
}
