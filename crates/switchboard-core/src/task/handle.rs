//! One task: state machine, event log and subscribers.

use crate::error::{Error, Result};
use crate::ids::{ContextId, TaskId};
use crate::protocol::{
    Artifact, ArtifactChunk, ArtifactError, Message, Task, TaskArtifactUpdateEvent, TaskEvent,
    TaskState, TaskStatus, TaskStatusUpdateEvent,
};
use crate::stream::EventStream;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::OnceLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct TaskInner {
    status: TaskStatus,
    history: Vec<Message>,
    artifacts: Vec<Artifact>,
    log: Vec<TaskEvent>,
    /// Index into `log` where the current turn starts
    turn_start: usize,
    next_seq: u64,
    subscribers: Vec<mpsc::Sender<TaskEvent>>,
}

/// An event recorded in the log, waiting to reach the subscribers it was
/// recorded for.
struct Delivery {
    event: TaskEvent,
    subscribers: Vec<mpsc::Sender<TaskEvent>>,
    is_final: bool,
}

/// Server-side state of one task.
///
/// The event log has one writer at a time (the owning execution loop, or a
/// caller cancelling) and any number of subscribers. State changes happen
/// under `inner`; delivery happens under `writer` only, so a slow subscriber
/// holds back the next write but never a snapshot, a subscribe or a cancel.
/// Non-final events wait on every live subscriber's bounded channel; final
/// events are handed off without waiting. A dropped subscriber is pruned.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    context_id: ContextId,
    created_at: DateTime<Utc>,
    inner: Mutex<TaskInner>,
    writer: Mutex<()>,
    cancel: CancellationToken,
    finished_at: OnceLock<DateTime<Utc>>,
    channel_capacity: usize,
}

impl TaskHandle {
    /// Create a task in `submitted`, with the opening message recorded.
    pub(crate) fn new(
        id: TaskId,
        context_id: ContextId,
        message: Message,
        channel_capacity: usize,
    ) -> Self {
        let status = TaskStatus::new(TaskState::Submitted, None);
        let submitted = TaskEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: id,
            context_id,
            seq: 1,
            status: status.clone(),
            is_final: false,
        });
        Self {
            id,
            context_id,
            created_at: status.timestamp,
            inner: Mutex::new(TaskInner {
                status,
                history: vec![message],
                artifacts: Vec::new(),
                log: vec![submitted],
                turn_start: 0,
                next_seq: 2,
                subscribers: Vec::new(),
            }),
            writer: Mutex::new(()),
            cancel: CancellationToken::new(),
            finished_at: OnceLock::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Task identifier
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Owning context
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Current state
    pub async fn state(&self) -> TaskState {
        self.inner.lock().await.status.state
    }

    /// When the task reached a terminal state, if it has
    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at.get().copied()
    }

    /// Token fired when the task is cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Messages exchanged so far
    pub async fn history(&self) -> Vec<Message> {
        self.inner.lock().await.history.clone()
    }

    /// Full event log, across turns
    pub async fn events(&self) -> Vec<TaskEvent> {
        self.inner.lock().await.log.clone()
    }

    /// Point-in-time view of the task
    pub async fn snapshot(&self) -> Task {
        let inner = self.inner.lock().await;
        Task {
            id: self.id,
            context_id: self.context_id,
            status: inner.status.clone(),
            artifacts: inner.artifacts.clone(),
            history: inner.history.clone(),
            created_at: self.created_at,
        }
    }

    /// Move to `state`, appending exactly one status update.
    pub async fn transition(&self, state: TaskState, message: Option<Message>) -> Result<()> {
        let _writer = self.writer.lock().await;
        let delivery = {
            let mut inner = self.inner.lock().await;
            self.apply_transition(&mut inner, state, message)?
        };
        self.deliver(delivery).await;
        Ok(())
    }

    /// Resume an `input_required` task with the caller's answer.
    ///
    /// Returns `false` without side effects if the task is not waiting on input.
    pub(crate) async fn resume(&self, message: Message) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let mut inner = self.inner.lock().await;
        match inner.status.state {
            TaskState::InputRequired => {
                inner.history.push(message);
                let delivery = self.apply_transition(&mut inner, TaskState::Working, None)?;
                drop(inner);
                self.deliver(delivery).await;
                Ok(true)
            }
            state if state.is_terminal() => Err(Error::TaskClosed {
                task_id: self.id,
                state,
            }),
            _ => Ok(false),
        }
    }

    /// Non-final status update while working (progress note).
    pub async fn note(&self, message: Message) -> Result<()> {
        let _writer = self.writer.lock().await;
        let delivery = {
            let mut inner = self.inner.lock().await;
            self.ensure_working(&inner)?;
            let status = TaskStatus::new(TaskState::Working, Some(message));
            let event = TaskEvent::StatusUpdate(TaskStatusUpdateEvent {
                task_id: self.id,
                context_id: self.context_id,
                seq: inner.next_seq,
                status,
                is_final: false,
            });
            record(&mut inner, event, false)
        };
        self.deliver(delivery).await;
        Ok(())
    }

    /// Emit one artifact chunk. Only legal while working.
    pub async fn emit_artifact(&self, chunk: ArtifactChunk) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut inner = self.inner.lock().await;
        self.ensure_working(&inner)?;

        let existing = inner
            .artifacts
            .iter()
            .position(|a| a.artifact_id == chunk.artifact_id);
        match existing {
            Some(index) => inner.artifacts[index].append(chunk.clone())?,
            None if chunk.seq == 0 => {
                let artifact = Artifact::from_chunk(chunk.clone())?;
                inner.artifacts.push(artifact);
            }
            None => {
                return Err(ArtifactError::OutOfOrder {
                    artifact_id: chunk.artifact_id,
                    expected: 0,
                    got: chunk.seq,
                }
                .into())
            }
        }

        let event = TaskEvent::ArtifactUpdate(TaskArtifactUpdateEvent {
            task_id: self.id,
            context_id: self.context_id,
            seq: inner.next_seq,
            artifact: chunk,
        });
        let delivery = record(&mut inner, event, false);
        drop(inner);
        self.deliver(delivery).await;
        Ok(())
    }

    /// Cancel the task. A terminal task is left untouched.
    ///
    /// The token fires first: the execution loop drops the executor, and with
    /// it any write parked on a full subscriber channel.
    pub async fn cancel(&self) -> Task {
        self.cancel.cancel();
        {
            let _writer = self.writer.lock().await;
            let delivery = {
                let mut inner = self.inner.lock().await;
                if inner.status.state.is_terminal() {
                    None
                } else {
                    match self.apply_transition(&mut inner, TaskState::Canceled, None) {
                        Ok(delivery) => Some(delivery),
                        Err(e) => {
                            debug!(task_id = %self.id, error = %e, "Cancel transition rejected");
                            None
                        }
                    }
                }
            };
            if let Some(delivery) = delivery {
                self.deliver(delivery).await;
            }
        }
        self.snapshot().await
    }

    /// Events of the current turn, then live events until the next final one.
    ///
    /// If the task already sits in a final state the stream is the replay alone.
    pub async fn subscribe(&self) -> EventStream {
        let mut inner = self.inner.lock().await;
        let replay: Vec<TaskEvent> = inner.log[inner.turn_start..].to_vec();
        if inner.status.state.is_final() {
            return stream::iter(replay).boxed();
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        inner.subscribers.push(tx);

        let live = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        stream::iter(replay).chain(live).boxed()
    }

    /// Wait until the current turn reaches a final state.
    pub async fn wait_final(&self) -> Task {
        let mut events = self.subscribe().await;
        while events.next().await.is_some() {}
        self.snapshot().await
    }

    fn ensure_working(&self, inner: &TaskInner) -> Result<()> {
        match inner.status.state {
            TaskState::Working => Ok(()),
            state if state.is_terminal() => Err(Error::TaskClosed {
                task_id: self.id,
                state,
            }),
            state => Err(Error::InvalidTransition {
                from: state,
                to: TaskState::Working,
            }),
        }
    }

    fn apply_transition(
        &self,
        inner: &mut TaskInner,
        state: TaskState,
        message: Option<Message>,
    ) -> Result<Delivery> {
        let from = inner.status.state;
        if from.is_terminal() {
            return Err(Error::TaskClosed {
                task_id: self.id,
                state: from,
            });
        }
        if !from.can_transition_to(state) {
            return Err(Error::InvalidTransition { from, to: state });
        }

        // Leaving input_required, by resume or by cancel, opens a new turn.
        if from == TaskState::InputRequired {
            inner.turn_start = inner.log.len();
        }
        if let Some(message) = &message {
            inner.history.push(message.clone());
        }
        inner.status = TaskStatus::new(state, message);
        if state.is_terminal() {
            let _ = self.finished_at.set(inner.status.timestamp);
        }

        debug!(task_id = %self.id, from = %from, to = %state, "Task transition");

        let event = TaskEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: self.id,
            context_id: self.context_id,
            seq: inner.next_seq,
            status: inner.status.clone(),
            is_final: state.is_final(),
        });
        Ok(record(inner, event, state.is_final()))
    }

    /// Send a recorded event. Call with `writer` held and `inner` released.
    async fn deliver(&self, delivery: Delivery) {
        let Delivery {
            event,
            subscribers,
            is_final,
        } = delivery;

        if is_final {
            // The senders were taken out of the handle; each one closes its
            // subscription once the final event is through.
            for tx in subscribers {
                match tx.try_send(event.clone()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        tokio::spawn(async move {
                            let _ = tx.send(event).await;
                        });
                    }
                }
            }
            return;
        }

        let mut pruned = false;
        for tx in &subscribers {
            if tx.send(event.clone()).await.is_err() {
                pruned = true;
            }
        }
        if pruned {
            self.inner
                .lock()
                .await
                .subscribers
                .retain(|tx| !tx.is_closed());
        }
    }
}

/// Append `event` to the log and pick the subscribers it goes to.
///
/// A final event takes the subscribers with it: nothing follows it in this
/// turn.
fn record(inner: &mut TaskInner, event: TaskEvent, is_final: bool) -> Delivery {
    inner.next_seq += 1;
    inner.log.push(event.clone());
    let subscribers = if is_final {
        std::mem::take(&mut inner.subscribers)
    } else {
        inner.subscribers.clone()
    };
    Delivery {
        event,
        subscribers,
        is_final,
    }
}
