//! Error types for switchboard-core
//!
//! The taxonomy mirrors how failures propagate between agents:
//! transport failures are retryable, protocol and correlation failures are not,
//! and routing failures are surfaced to the user as typed results rather than
//! errors (see `supervisor::RouteError`).

use crate::ids::{ContextId, TaskId};
use crate::protocol::{ArtifactError, TaskState};
use std::time::Duration;
use thiserror::Error;

/// Network-level failure talking to a remote agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The call did not reach a final event in time
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Connection refused, reset, DNS failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// Remote answered with an unexpected HTTP status
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Payload could not be decoded
    #[error("malformed payload: {0}")]
    Decode(String),

    /// The event stream ended before a final status update
    #[error("event stream closed before the task reached a final state")]
    StreamClosed,
}

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Network or timeout failure (retryable)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message references a context or task this agent never created
    #[error("unknown context {context_id}{}", task_suffix(.task_id))]
    UnknownContext {
        /// Context carried by the request
        context_id: ContextId,
        /// Task id carried by the request, if any
        task_id: Option<TaskId>,
    },

    /// Task id is not known to this agent
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// Task is terminal and accepts no further messages or events
    #[error("task {task_id} is closed ({state})")]
    TaskClosed {
        /// Task identifier
        task_id: TaskId,
        /// Terminal state the task is in
        state: TaskState,
    },

    /// Illegal lifecycle transition
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: TaskState,
        /// Requested state
        to: TaskState,
    },

    /// Artifact chunk violates ordering or completion rules
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Domain tool adapter inside a sub-agent failed
    #[error("upstream tool '{tool}' failed: {message}")]
    UpstreamTool {
        /// Tool name
        tool: String,
        /// Upstream error text, verbatim
        message: String,
    },

    /// The call was cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// Remote agent sent something that violates the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

fn task_suffix(task_id: &Option<TaskId>) -> String {
    task_id
        .map(|t| format!(" (task {})", t))
        .unwrap_or_default()
}

impl Error {
    /// Whether the failure may go away on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for user-friendly error messages
///
/// Failures shown to end users carry what failed and why, never internals.
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get a suggestion for how to fix the error
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self {
            Error::Transport(TransportError::Timeout(d)) => {
                format!("⏳ The agent did not answer within {}s.", d.as_secs())
            }
            Error::Transport(e) => format!("🌐 Could not reach the agent: {}", e),
            Error::UnknownContext { .. } | Error::UnknownTask(_) => {
                "🔗 The agent has no record of this conversation.".to_string()
            }
            Error::TaskClosed { state, .. } => {
                format!("📪 That task is already {}.", state)
            }
            Error::InvalidTransition { from, to } => {
                format!("⚠️ Task cannot move from {} to {}.", from, to)
            }
            Error::Artifact(e) => format!("📦 Malformed agent output: {}", e),
            Error::UpstreamTool { tool, message } => {
                format!("🔧 {} failed: {}", tool, message)
            }
            Error::Cancelled => "🛑 Request cancelled.".to_string(),
            Error::Protocol(msg) => format!("📡 Agent protocol error: {}", msg),
            Error::Configuration(msg) => format!("⚙️ Configuration error: {}", msg),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Error::Transport(_) => {
                Some("💡 Check that the agent is running and reachable.".to_string())
            }
            Error::UnknownContext { .. } | Error::UnknownTask(_) | Error::TaskClosed { .. } => {
                Some("💡 Send the request again to start a new task.".to_string())
            }
            Error::UpstreamTool { .. } => {
                Some("💡 Check the credentials and status of the external service.".to_string())
            }
            Error::Configuration(_) => {
                Some("💡 Check config/default.toml or SWITCHBOARD_* variables.".to_string())
            }
            _ => None,
        }
    }
}

/// Format an error for display in a chat message
pub fn format_error_for_chat(error: &dyn UserFriendlyError) -> String {
    let mut output = error.user_message();

    if let Some(suggestion) = error.suggestion() {
        output.push_str("\n\n");
        output.push_str(&suggestion);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(Error::Transport(TransportError::StreamClosed).is_retryable());
        assert!(!Error::UnknownContext {
            context_id: ContextId::new(),
            task_id: None
        }
        .is_retryable());
        assert!(!Error::UpstreamTool {
            tool: "jira".to_string(),
            message: "401".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_unknown_context_display_includes_task() {
        let task_id = TaskId::new();
        let err = Error::UnknownContext {
            context_id: ContextId::new(),
            task_id: Some(task_id),
        };
        assert!(err.to_string().contains(&task_id.to_string()));
    }

    #[test]
    fn test_upstream_message_preserved() {
        let err = Error::UpstreamTool {
            tool: "argocd".to_string(),
            message: "rpc error: code = PermissionDenied".to_string(),
        };
        assert!(err
            .user_message()
            .contains("rpc error: code = PermissionDenied"));
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::Transport(TransportError::Timeout(Duration::from_secs(30)));
        assert!(err.user_message().contains("30s"));
        assert_eq!(err.to_string(), "transport error: timed out after 30000ms");
    }

    #[test]
    fn test_format_error_for_chat() {
        let err = Error::Transport(TransportError::Connection("refused".to_string()));
        let output = format_error_for_chat(&err);
        assert!(output.contains("refused"));
        assert!(output.contains("reachable"));
    }
}
