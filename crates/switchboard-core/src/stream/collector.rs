use super::DedupPolicy;
use crate::error::{Error, Result, TransportError};
use crate::ids::{ContextId, TaskId};
use crate::protocol::{Artifact, Message, Task, TaskEvent, TaskState, TaskStatus};
use serde_json::Value;
use tracing::debug;

/// Final view of one task turn, as a caller sees it.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    /// Task identifier
    pub task_id: TaskId,
    /// Context identifier
    pub context_id: ContextId,
    /// Final state of the turn
    pub state: TaskState,
    /// User-visible text, each piece surfaced exactly once
    pub text: String,
    /// Artifacts in creation order
    pub artifacts: Vec<Artifact>,
    /// Message of the final status update
    pub status_message: Option<Message>,
    /// Structured parts of the final message
    pub data: Vec<Value>,
    /// Progress notes seen while working
    pub progress: Vec<String>,
}

impl CollectedResponse {
    /// Build from a task snapshot (blocking send).
    pub fn from_task(task: Task, policy: &DedupPolicy) -> Self {
        let (text, data) = compose(policy, &task.artifacts, &task.status);
        Self {
            task_id: task.id,
            context_id: task.context_id,
            state: task.status.state,
            text,
            artifacts: task.artifacts,
            status_message: task.status.message,
            data,
            progress: Vec::new(),
        }
    }

    /// The `error` object of a failed turn, if the agent sent one
    #[must_use]
    pub fn error_detail(&self) -> Option<&Value> {
        self.data.iter().find_map(|d| d.get("error"))
    }

    /// The agent marked its failure as worth retrying
    #[must_use]
    pub fn is_retryable_failure(&self) -> bool {
        self.state == TaskState::Failed
            && self
                .error_detail()
                .and_then(|e| e.get("retryable"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// The agent flagged its own answer as low confidence or incomplete
    #[must_use]
    pub fn is_low_confidence(&self) -> bool {
        self.data.iter().any(|d| {
            d.get("confidence").and_then(Value::as_str) == Some("low")
                || d.get("incomplete").and_then(Value::as_bool) == Some(true)
        })
    }
}

/// Consumes the events of one task turn.
///
/// Duplicate or stale events (by `seq`) are dropped; anything after the final
/// status update is ignored.
#[derive(Debug)]
pub struct ResponseCollector {
    policy: DedupPolicy,
    task_id: Option<TaskId>,
    context_id: Option<ContextId>,
    last_seq: u64,
    artifacts: Vec<Artifact>,
    progress: Vec<String>,
    final_status: Option<TaskStatus>,
}

impl ResponseCollector {
    /// Create a collector applying `policy`
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            task_id: None,
            context_id: None,
            last_seq: 0,
            artifacts: Vec::new(),
            progress: Vec::new(),
            final_status: None,
        }
    }

    /// Task seen so far
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Whether the final status update has arrived
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.final_status.is_some()
    }

    /// Apply one event. Returns `true` once the turn is final.
    pub fn push(&mut self, event: TaskEvent) -> Result<bool> {
        if self.is_done() {
            debug!(seq = event.seq(), "Event after final update ignored");
            return Ok(true);
        }

        match (self.task_id, self.context_id) {
            (Some(task_id), Some(context_id)) => {
                if event.task_id() != task_id || event.context_id() != context_id {
                    return Err(Error::Protocol(format!(
                        "event for task {} in a stream for task {}",
                        event.task_id(),
                        task_id
                    )));
                }
            }
            _ => {
                self.task_id = Some(event.task_id());
                self.context_id = Some(event.context_id());
            }
        }

        if event.seq() <= self.last_seq {
            debug!(seq = event.seq(), last = self.last_seq, "Duplicate event dropped");
            return Ok(false);
        }
        self.last_seq = event.seq();

        match event {
            TaskEvent::ArtifactUpdate(update) => {
                let chunk = update.artifact;
                match self
                    .artifacts
                    .iter()
                    .position(|a| a.artifact_id == chunk.artifact_id)
                {
                    Some(index) => self.artifacts[index].append(chunk)?,
                    None => self.artifacts.push(Artifact::from_chunk(chunk)?),
                }
                Ok(false)
            }
            TaskEvent::StatusUpdate(update) if update.is_final => {
                self.final_status = Some(update.status);
                Ok(true)
            }
            TaskEvent::StatusUpdate(update) => {
                if let Some(text) = update.status.message.as_ref().map(Message::text) {
                    if !text.trim().is_empty() {
                        self.progress.push(text);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Assemble the response. Fails if the stream ended without a final update.
    pub fn finish(self) -> Result<CollectedResponse> {
        let (Some(status), Some(task_id), Some(context_id)) =
            (self.final_status, self.task_id, self.context_id)
        else {
            return Err(TransportError::StreamClosed.into());
        };

        let (text, data) = compose(&self.policy, &self.artifacts, &status);
        Ok(CollectedResponse {
            task_id,
            context_id,
            state: status.state,
            text,
            artifacts: self.artifacts,
            status_message: status.message,
            data,
            progress: self.progress,
        })
    }
}

/// Complete artifacts first, then the final message unless the policy hides it.
fn compose(policy: &DedupPolicy, artifacts: &[Artifact], status: &TaskStatus) -> (String, Vec<Value>) {
    let artifact_texts: Vec<String> = artifacts
        .iter()
        .filter(|a| a.complete)
        .map(Artifact::text)
        .collect();

    let mut segments: Vec<String> = artifact_texts
        .iter()
        .filter(|t| !t.trim().is_empty())
        .cloned()
        .collect();
    let mut data = Vec::new();

    if let Some(message) = &status.message {
        data.extend(message.data().cloned());
        let text = message.text();
        if policy.suppresses(&text, &artifact_texts) {
            debug!(state = %status.state, "Final message suppressed as duplicate");
        } else if !text.is_empty() {
            segments.push(text);
        }
    }

    (segments.join("\n\n"), data)
}
