//! Task lifecycle engine
//!
//! A [`TaskManager`] is the receiving side of the agent RPC surface. It turns
//! incoming messages into tasks, runs the agent's [`AgentExecutor`] for each
//! turn, and exposes every task's event log to subscribers.
//!
//! ```text
//! send ─► accept ─┬─ new context ──► submitted ─► run ─► working ─► final
//!                 ├─ input_required ─────────────► run ─► working ─► final
//!                 └─ submitted/working ─► attach (no second run)
//! ```

mod executor;
mod handle;


pub use executor::{
    AgentExecutor, ArtifactWriter, ExecutionOutcome, ExecutorError, RequestContext, TaskUpdater,
};
pub use handle::TaskHandle;

use crate::error::{Error, Result};
use crate::ids::{IdentityManager, TaskId};
use crate::protocol::{AgentDescriptor, Message, Part, Role, SendMessageRequest, Task, TaskState};
use crate::stream::EventStream;
use crate::utils::{
    retry_bounded, Attempt, AttemptInfo, Exhausted, RetryBudget, RetryClass, RetryConfig,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Task engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Retries of a failed upstream tool call within one turn
    #[serde(default = "default_upstream_retries")]
    pub upstream_retries: u32,
    /// Delay before an upstream retry (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Bounded buffer per subscriber
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long a terminal task stays queryable (seconds)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_upstream_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_channel_capacity() -> usize {
    32
}

fn default_retention_secs() -> u64 {
    3600
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            upstream_retries: default_upstream_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            channel_capacity: default_channel_capacity(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl TaskConfig {
    fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_budget(RetryBudget {
                transport: 0,
                upstream_tool: self.upstream_retries,
                semantic: 0,
            })
            .with_initial_delay(Duration::from_millis(self.retry_delay_ms))
    }
}

/// Owns every task of one agent.
pub struct TaskManager {
    descriptor: AgentDescriptor,
    executor: Arc<dyn AgentExecutor>,
    identity: Arc<IdentityManager>,
    tasks: DashMap<TaskId, Arc<TaskHandle>>,
    config: TaskConfig,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("agent", &self.descriptor.id)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl TaskManager {
    /// Create a manager for the agent described by `descriptor`.
    pub fn new(descriptor: AgentDescriptor, executor: Arc<dyn AgentExecutor>) -> Self {
        Self::with_config(descriptor, executor, TaskConfig::default())
    }

    /// Create with explicit configuration
    pub fn with_config(
        descriptor: AgentDescriptor,
        executor: Arc<dyn AgentExecutor>,
        config: TaskConfig,
    ) -> Self {
        Self {
            descriptor,
            executor,
            identity: Arc::new(IdentityManager::new()),
            tasks: DashMap::new(),
            config,
        }
    }

    /// Capability document served to callers
    #[must_use]
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// The identity table deriving this agent's task ids
    #[must_use]
    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    /// Send a message and wait until the task reaches a final state.
    pub async fn send_message(self: &Arc<Self>, request: SendMessageRequest) -> Result<Task> {
        let handle = self.accept(request).await?;
        Ok(handle.wait_final().await)
    }

    /// Send a message and stream the task's events for this turn.
    pub async fn send_message_streaming(
        self: &Arc<Self>,
        request: SendMessageRequest,
    ) -> Result<EventStream> {
        let handle = self.accept(request).await?;
        Ok(handle.subscribe().await)
    }

    /// Subscribe to an existing task.
    pub async fn subscribe(&self, task_id: &TaskId) -> Result<EventStream> {
        Ok(self.handle(task_id)?.subscribe().await)
    }

    /// Snapshot of an existing task.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        Ok(self.handle(task_id)?.snapshot().await)
    }

    /// Handle of an existing task.
    pub fn handle(&self, task_id: &TaskId) -> Result<Arc<TaskHandle>> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownTask(*task_id))
    }

    /// Cancel a task. Cancelling a terminal task is a no-op.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<Task> {
        let handle = self.handle(task_id)?;
        let task = handle.cancel().await;
        self.identity.release(&task.context_id, task_id);
        info!(task_id = %task_id, state = %task.status.state, "Cancel requested");
        Ok(task)
    }

    /// Number of tasks held (running, waiting, or terminal within retention)
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Ids of every task held, in no particular order
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop terminal tasks older than the retention window.
    ///
    /// Runs on every accepted message. Returns how many tasks were dropped;
    /// their ids answer `UnknownTask` from then on.
    pub fn evict_expired(&self) -> usize {
        let Some(cutoff) = i64::try_from(self.config.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let before = self.tasks.len();
        self.tasks
            .retain(|_, handle| handle.finished_at().map_or(true, |at| at > cutoff));
        let evicted = before.saturating_sub(self.tasks.len());
        if evicted > 0 {
            debug!(agent = %self.descriptor.id, evicted, "Expired tasks dropped");
        }
        evicted
    }

    async fn accept(self: &Arc<Self>, request: SendMessageRequest) -> Result<Arc<TaskHandle>> {
        self.evict_expired();
        let context_id = request.context_id;

        if let Some(task_id) = request.task_id {
            let handle = self
                .tasks
                .get(&task_id)
                .map(|entry| entry.value().clone())
                .filter(|handle| handle.context_id() == context_id)
                .ok_or(Error::UnknownContext {
                    context_id,
                    task_id: Some(task_id),
                })?;
            let message = request.message.with_context(context_id).with_task(task_id);
            return self.continue_task(handle, message).await;
        }

        // A terminal task may still hold the context entry until its loop
        // releases it; release and derive again.
        for _ in 0..2 {
            let (task_id, _) = self.identity.derive_task(context_id);
            let message = request
                .message
                .clone()
                .with_context(context_id)
                .with_task(task_id);

            let mut inserted = false;
            let handle = self
                .tasks
                .entry(task_id)
                .or_insert_with(|| {
                    inserted = true;
                    Arc::new(TaskHandle::new(
                        task_id,
                        context_id,
                        message.clone(),
                        self.config.channel_capacity,
                    ))
                })
                .clone();

            if inserted {
                info!(
                    agent = %self.descriptor.id,
                    task_id = %task_id,
                    context_id = %context_id,
                    "Task submitted"
                );
                self.spawn_run(handle.clone());
                return Ok(handle);
            }

            match self.continue_task(handle, message).await {
                Err(Error::TaskClosed { .. }) => {
                    self.identity.release(&context_id, &task_id);
                }
                other => return other,
            }
        }

        Err(Error::Protocol(format!(
            "could not open a task for context {context_id}"
        )))
    }

    async fn continue_task(
        self: &Arc<Self>,
        handle: Arc<TaskHandle>,
        message: Message,
    ) -> Result<Arc<TaskHandle>> {
        if handle.resume(message).await? {
            info!(task_id = %handle.id(), "Task resumed with caller input");
            self.spawn_run(handle.clone());
        } else {
            debug!(task_id = %handle.id(), "Message attached to running task");
        }
        Ok(handle)
    }

    fn spawn_run(self: &Arc<Self>, handle: Arc<TaskHandle>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(handle).await });
    }

    async fn run(&self, handle: Arc<TaskHandle>) {
        let task_id = handle.id();
        if handle.state().await == TaskState::Submitted {
            if let Err(e) = handle.transition(TaskState::Working, None).await {
                debug!(task_id = %task_id, error = %e, "Task did not start");
                return;
            }
        }

        let history = handle.history().await;
        let Some(message) = history.iter().rev().find(|m| m.role == Role::Caller).cloned() else {
            warn!(task_id = %task_id, "Task has no caller message");
            return;
        };

        let retry = self.config.retry_config();
        let cancel = handle.cancellation_token();
        let started = std::time::Instant::now();

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task_id = %task_id, "Execution dropped after cancel");
                return;
            }
            result = retry_bounded(&retry, |info: AttemptInfo<ExecutorError>| {
                let executor = self.executor.clone();
                let updater = TaskUpdater::new(handle.clone());
                let ctx = RequestContext {
                    task_id,
                    context_id: handle.context_id(),
                    message: message.clone(),
                    history: history.clone(),
                    attempt: info.attempt,
                    previous_error: info.previous.map(|(_, e)| e.to_string()),
                };
                async move {
                    match executor.execute(ctx, updater).await {
                        Ok(outcome) => Attempt::Done(outcome),
                        Err(e @ ExecutorError::UpstreamTool { .. }) => {
                            Attempt::Retryable(RetryClass::UpstreamTool, e)
                        }
                        Err(e) => Attempt::Fatal(e),
                    }
                }
            }) => result,
        };

        let (state, message) = match result {
            Ok(ExecutionOutcome::Completed { message }) => (TaskState::Completed, message),
            Ok(ExecutionOutcome::InputRequired { question }) => {
                (TaskState::InputRequired, Some(question))
            }
            Err(exhausted) => {
                warn!(
                    task_id = %task_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Task failed"
                );
                (TaskState::Failed, Some(failure_message(&exhausted)))
            }
        };
        let message = message.map(|m| m.with_context(handle.context_id()).with_task(task_id));

        match handle.transition(state, message).await {
            Ok(()) => info!(
                agent = %self.descriptor.id,
                task_id = %task_id,
                state = %state,
                duration_ms = started.elapsed().as_millis() as u64,
                "Task turn finished"
            ),
            Err(e) => debug!(task_id = %task_id, error = %e, "Late outcome ignored"),
        }

        if state.is_terminal() {
            self.identity.release(&handle.context_id(), &task_id);
        }
    }
}

/// Failure message: human-readable text plus a structured error part.
fn failure_message(exhausted: &Exhausted<ExecutorError>) -> Message {
    match &exhausted.last_error {
        ExecutorError::UpstreamTool { tool, message } => Message::agent_text(format!(
            "Upstream tool '{}' failed after {} attempts: {}",
            tool, exhausted.attempts, message
        ))
        .with_part(Part::data(serde_json::json!({
            "error": {
                "kind": "upstream_tool",
                "tool": tool,
                "message": message,
                "retryable": true,
            }
        }))),
        ExecutorError::Unrecoverable(message) => Message::agent_text(message.clone()).with_part(
            Part::data(serde_json::json!({
                "error": {
                    "kind": "unrecoverable",
                    "message": message,
                    "retryable": false,
                }
            })),
        ),
    }
}
