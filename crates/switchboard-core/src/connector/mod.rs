//! Remote agent connector
//!
//! One [`RemoteAgentConnector`] per sub-agent. A call sends a message over an
//! [`AgentTransport`], consumes the event stream until the turn is final, and
//! bounds the whole exchange with a timeout and the caller's cancel token.

mod http;
mod local;

pub use http::HttpTransport;
pub use local::LocalTransport;

use crate::error::{Error, Result, TransportError};
use crate::ids::{ContextId, TaskId, ThreadId};
use crate::protocol::{AgentDescriptor, Message, SendMessageRequest, Task};
use crate::stream::{CollectedResponse, DedupPolicy, EventStream, ResponseCollector};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The agent RPC surface, as seen from the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Capability discovery
    async fn fetch_descriptor(&self) -> Result<AgentDescriptor>;

    /// Send and wait for the final state of the turn
    async fn send_message(&self, request: SendMessageRequest) -> Result<Task>;

    /// Send and stream the turn's events
    async fn send_streaming(&self, request: SendMessageRequest) -> Result<EventStream>;

    /// Stream the current turn of an existing task
    async fn subscribe(&self, task_id: TaskId) -> Result<EventStream>;

    /// Cancel a task (idempotent)
    async fn cancel_task(&self, task_id: TaskId) -> Result<Task>;
}

/// Connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Upper bound for one call, send to final event (seconds)
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Upper bound for the best-effort remote cancel (seconds)
    #[serde(default = "default_cancel_timeout_secs")]
    pub cancel_timeout_secs: u64,
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_cancel_timeout_secs() -> u64 {
    5
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            cancel_timeout_secs: default_cancel_timeout_secs(),
        }
    }
}

impl ConnectorConfig {
    /// Call timeout as a `Duration`
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Cancel timeout as a `Duration`
    #[must_use]
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }
}

/// Correlation and cancellation for one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Conversation the call belongs to
    pub thread_id: ThreadId,
    /// Request context carried on every message
    pub context_id: ContextId,
    /// Task to continue, if any
    pub task_id: Option<TaskId>,
    /// Fired when the caller gives up
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Context for a new task
    pub fn new(thread_id: ThreadId, context_id: ContextId) -> Self {
        Self {
            thread_id,
            context_id,
            task_id: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Continue an existing task
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Use the caller's cancel token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Calls one sub-agent.
pub struct RemoteAgentConnector {
    descriptor: AgentDescriptor,
    transport: Arc<dyn AgentTransport>,
    config: ConnectorConfig,
    dedup: DedupPolicy,
}

impl std::fmt::Debug for RemoteAgentConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAgentConnector")
            .field("agent", &self.descriptor.id)
            .field("address", &self.descriptor.address)
            .finish()
    }
}

impl RemoteAgentConnector {
    /// Create a connector
    pub fn new(
        descriptor: AgentDescriptor,
        transport: Arc<dyn AgentTransport>,
        config: ConnectorConfig,
        dedup: DedupPolicy,
    ) -> Self {
        Self {
            descriptor,
            transport,
            config,
            dedup,
        }
    }

    /// Descriptor of the agent behind this connector
    #[must_use]
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Agent identifier
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.descriptor.id
    }

    /// Send `message` and collect the turn.
    ///
    /// On timeout or cancellation the remote task, if one was seen, is
    /// cancelled before returning.
    pub async fn call(&self, ctx: &CallContext, message: Message) -> Result<CollectedResponse> {
        let started = Instant::now();
        let timeout = self.config.call_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let request = SendMessageRequest {
            context_id: ctx.context_id,
            task_id: ctx.task_id,
            message: message.with_context(ctx.context_id),
        };

        info!(
            agent = %self.descriptor.id,
            thread_id = %ctx.thread_id,
            context_id = %ctx.context_id,
            "Calling agent"
        );

        let mut events = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                self.cancel_remote(ctx.task_id).await;
                return Err(Error::Cancelled);
            }
            _ = &mut deadline => {
                self.cancel_remote(ctx.task_id).await;
                return Err(TransportError::Timeout(timeout).into());
            }
            opened = self.transport.send_streaming(request) => opened?,
        };

        let mut collector = ResponseCollector::new(self.dedup);
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    drop(events);
                    self.cancel_remote(collector.task_id().or(ctx.task_id)).await;
                    return Err(Error::Cancelled);
                }
                _ = &mut deadline => {
                    drop(events);
                    warn!(
                        agent = %self.descriptor.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Agent call timed out"
                    );
                    self.cancel_remote(collector.task_id().or(ctx.task_id)).await;
                    return Err(TransportError::Timeout(timeout).into());
                }
                next = events.next() => match next {
                    Some(event) => {
                        if collector.push(event)? {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        let response = collector.finish()?;
        debug!(
            agent = %self.descriptor.id,
            task_id = %response.task_id,
            state = %response.state,
            duration_ms = started.elapsed().as_millis() as u64,
            "Agent call finished"
        );
        Ok(response)
    }

    /// Cancel a task directly.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        self.transport.cancel_task(task_id).await
    }

    async fn cancel_remote(&self, task_id: Option<TaskId>) {
        let Some(task_id) = task_id else {
            return;
        };
        match tokio::time::timeout(self.config.cancel_timeout(), self.transport.cancel_task(task_id))
            .await
        {
            Ok(Ok(task)) => debug!(task_id = %task_id, state = %task.status.state, "Remote task cancelled"),
            Ok(Err(e)) => debug!(task_id = %task_id, error = %e, "Remote cancel failed"),
            Err(_) => debug!(task_id = %task_id, "Remote cancel timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ArtifactChunk, Part, TaskArtifactUpdateEvent, TaskEvent, TaskState, TaskStatus,
        TaskStatusUpdateEvent,
    };
    use futures::stream;

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor::new("argocd", "Argo CD", "http://argocd.local")
    }

    fn connector(transport: MockAgentTransport) -> RemoteAgentConnector {
        RemoteAgentConnector::new(
            descriptor(),
            Arc::new(transport),
            ConnectorConfig {
                call_timeout_secs: 2,
                cancel_timeout_secs: 1,
            },
            DedupPolicy::default(),
        )
    }

    fn answer_events(task_id: TaskId, context_id: ContextId) -> Vec<TaskEvent> {
        vec![
            TaskEvent::ArtifactUpdate(TaskArtifactUpdateEvent {
                task_id,
                context_id,
                seq: 1,
                artifact: ArtifactChunk {
                    artifact_id: "a".to_string(),
                    name: "answer".to_string(),
                    seq: 0,
                    parts: vec![Part::text("prod-app synced")],
                    last_chunk: true,
                },
            }),
            TaskEvent::StatusUpdate(TaskStatusUpdateEvent {
                task_id,
                context_id,
                seq: 2,
                status: TaskStatus::new(TaskState::Completed, Some(Message::agent_text(""))),
                is_final: true,
            }),
        ]
    }

    #[tokio::test]
    async fn test_call_collects_answer() {
        let ctx = CallContext::new(ThreadId::new(), ContextId::new());
        let task_id = TaskId::new();
        let events = answer_events(task_id, ctx.context_id);

        let mut transport = MockAgentTransport::new();
        transport
            .expect_send_streaming()
            .withf(|req| req.message.context_id == Some(req.context_id) && req.task_id.is_none())
            .times(1)
            .returning(move |_| Ok(stream::iter(events.clone()).boxed()));
        transport.expect_cancel_task().never();

        let response = connector(transport)
            .call(&ctx, Message::caller_text("sync prod"))
            .await
            .unwrap();
        assert_eq!(response.task_id, task_id);
        assert_eq!(response.text, "prod-app synced");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_seen_task() {
        let ctx = CallContext::new(ThreadId::new(), ContextId::new());
        let task_id = TaskId::new();
        let first = answer_events(task_id, ctx.context_id).remove(0);

        let mut transport = MockAgentTransport::new();
        transport.expect_send_streaming().returning(move |_| {
            Ok(stream::iter(vec![first.clone()])
                .chain(stream::pending())
                .boxed())
        });
        transport
            .expect_cancel_task()
            .withf(move |id| *id == task_id)
            .times(1)
            .returning(|id| Err(Error::UnknownTask(id)));

        let err = connector(transport)
            .call(&ctx, Message::caller_text("sync prod"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Timeout(_))));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_before_any_event_skips_cancel() {
        let ctx = CallContext::new(ThreadId::new(), ContextId::new());
        let mut transport = MockAgentTransport::new();
        transport
            .expect_send_streaming()
            .returning(|_| Ok(stream::pending().boxed()));
        transport.expect_cancel_task().never();

        let err = connector(transport)
            .call(&ctx, Message::caller_text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_caller_cancel() {
        let ctx = CallContext::new(ThreadId::new(), ContextId::new());
        let task_id = TaskId::new();
        let first = answer_events(task_id, ctx.context_id).remove(0);

        let mut transport = MockAgentTransport::new();
        transport.expect_send_streaming().returning(move |_| {
            Ok(stream::iter(vec![first.clone()])
                .chain(stream::pending())
                .boxed())
        });
        transport
            .expect_cancel_task()
            .times(1)
            .returning(|id| Err(Error::UnknownTask(id)));

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = connector(transport)
            .call(&ctx, Message::caller_text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_cut_short_is_transport_error() {
        let ctx = CallContext::new(ThreadId::new(), ContextId::new());
        let first = answer_events(TaskId::new(), ctx.context_id).remove(0);

        let mut transport = MockAgentTransport::new();
        transport
            .expect_send_streaming()
            .returning(move |_| Ok(stream::iter(vec![first.clone()]).boxed()));

        let err = connector(transport)
            .call(&ctx, Message::caller_text("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_remote_error_propagates() {
        let ctx = CallContext::new(ThreadId::new(), ContextId::new()).with_task(TaskId::new());
        let mut transport = MockAgentTransport::new();
        transport.expect_send_streaming().returning(|req| {
            Err(Error::UnknownContext {
                context_id: req.context_id,
                task_id: req.task_id,
            })
        });

        let err = connector(transport)
            .call(&ctx, Message::caller_text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownContext { .. }));
    }
}
