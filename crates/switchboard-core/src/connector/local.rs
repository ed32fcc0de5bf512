use super::AgentTransport;
use crate::error::Result;
use crate::ids::TaskId;
use crate::protocol::{AgentDescriptor, SendMessageRequest, Task};
use crate::stream::EventStream;
use crate::task::TaskManager;
use async_trait::async_trait;
use std::sync::Arc;

/// Calls a [`TaskManager`] living in the same process.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    manager: Arc<TaskManager>,
}

impl LocalTransport {
    /// Wrap a task manager
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AgentTransport for LocalTransport {
    async fn fetch_descriptor(&self) -> Result<AgentDescriptor> {
        Ok(self.manager.descriptor().clone())
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<Task> {
        self.manager.send_message(request).await
    }

    async fn send_streaming(&self, request: SendMessageRequest) -> Result<EventStream> {
        self.manager.send_message_streaming(request).await
    }

    async fn subscribe(&self, task_id: TaskId) -> Result<EventStream> {
        self.manager.subscribe(&task_id).await
    }

    async fn cancel_task(&self, task_id: TaskId) -> Result<Task> {
        self.manager.cancel_task(&task_id).await
    }
}
