//! The seam between the task engine and an agent's resolution logic.

use super::handle::TaskHandle;
use crate::error::Error;
use crate::ids::{ContextId, TaskId};
use crate::protocol::{ArtifactChunk, Message, Part};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Everything the resolution logic gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Task being executed
    pub task_id: TaskId,
    /// Owning context
    pub context_id: ContextId,
    /// The caller message that started this turn
    pub message: Message,
    /// Every message of the task so far, oldest first
    pub history: Vec<Message>,
    /// 1-based attempt number within this turn
    pub attempt: u32,
    /// Why the previous attempt failed, on retries
    pub previous_error: Option<String>,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Final answer; the message may be empty when the answer went out as artifacts
    Completed {
        /// Closing status message
        message: Option<Message>,
    },
    /// The caller has to supply more information
    InputRequired {
        /// What to ask the caller
        question: Message,
    },
}

impl ExecutionOutcome {
    /// Completed with a text answer
    pub fn completed_text(text: impl Into<String>) -> Self {
        Self::Completed {
            message: Some(Message::agent_text(text)),
        }
    }

    /// Ask the caller a question
    pub fn ask(question: impl Into<String>) -> Self {
        Self::InputRequired {
            question: Message::agent_text(question),
        }
    }
}

/// Failure of the resolution logic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// A domain tool call failed; retried once by the engine
    #[error("upstream tool '{tool}' failed: {message}")]
    UpstreamTool {
        /// Tool name
        tool: String,
        /// Upstream error text, verbatim
        message: String,
    },

    /// Credential failure, irreconcilable upstream response, engine error
    #[error("{0}")]
    Unrecoverable(String),
}

impl ExecutorError {
    /// Upstream tool failure
    pub fn upstream(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamTool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

impl From<Error> for ExecutorError {
    fn from(error: Error) -> Self {
        match error {
            Error::UpstreamTool { tool, message } => Self::UpstreamTool { tool, message },
            other => Self::Unrecoverable(other.to_string()),
        }
    }
}

/// An agent's resolution logic.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Resolve one turn of a task, reporting progress through `updater`.
    async fn execute(
        &self,
        ctx: RequestContext,
        updater: TaskUpdater,
    ) -> std::result::Result<ExecutionOutcome, ExecutorError>;
}

/// Write access to a running task's event log.
#[derive(Debug, Clone)]
pub struct TaskUpdater {
    handle: Arc<TaskHandle>,
}

impl TaskUpdater {
    pub(crate) fn new(handle: Arc<TaskHandle>) -> Self {
        Self { handle }
    }

    /// Task being updated
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.handle.id()
    }

    /// Owning context
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.handle.context_id()
    }

    /// Whether the caller cancelled the task
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.cancellation_token().is_cancelled()
    }

    /// Publish a non-final progress note.
    pub async fn progress(&self, text: impl Into<String>) -> crate::Result<()> {
        self.handle
            .note(
                Message::agent_text(text)
                    .with_context(self.handle.context_id())
                    .with_task(self.handle.id()),
            )
            .await
    }

    /// Emit a raw chunk.
    pub async fn emit_chunk(&self, chunk: ArtifactChunk) -> crate::Result<()> {
        self.handle.emit_artifact(chunk).await
    }

    /// Start a new artifact.
    pub fn artifact(&self, name: impl Into<String>) -> ArtifactWriter {
        ArtifactWriter {
            handle: self.handle.clone(),
            artifact_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            next_seq: 0,
        }
    }
}

/// Streams one artifact chunk by chunk.
#[derive(Debug)]
pub struct ArtifactWriter {
    handle: Arc<TaskHandle>,
    artifact_id: String,
    name: String,
    next_seq: u64,
}

impl ArtifactWriter {
    /// Artifact identifier
    #[must_use]
    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    /// Append a chunk of text.
    pub async fn append_text(&mut self, text: impl Into<String>) -> crate::Result<()> {
        self.append(vec![Part::text(text)]).await
    }

    /// Append a chunk.
    pub async fn append(&mut self, parts: Vec<Part>) -> crate::Result<()> {
        self.emit(parts, false).await
    }

    /// Close the artifact with a final, possibly empty, chunk.
    pub async fn finish(mut self, parts: Vec<Part>) -> crate::Result<()> {
        self.emit(parts, true).await
    }

    async fn emit(&mut self, parts: Vec<Part>, last_chunk: bool) -> crate::Result<()> {
        self.handle
            .emit_artifact(ArtifactChunk {
                artifact_id: self.artifact_id.clone(),
                name: self.name.clone(),
                seq: self.next_seq,
                parts,
                last_chunk,
            })
            .await?;
        self.next_seq += 1;
        Ok(())
    }
}
