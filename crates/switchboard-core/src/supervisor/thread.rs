//! Conversation threads.
//!
//! The supervisor is the only writer. Sub-agents never see a thread, only the
//! contexts minted inside it.

use crate::ids::{ContextId, ThreadId};
use crate::protocol::TaskState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The end user
    User,
    /// The supervisor's aggregated answer
    Supervisor,
}

/// One entry of a thread's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Producer
    pub role: TurnRole,
    /// Request context the turn belongs to
    pub context_id: ContextId,
    /// Text shown to or typed by the user
    pub text: String,
    /// Aggregated state, for supervisor turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    /// When the turn was recorded
    pub at: DateTime<Utc>,
}

impl Turn {
    /// User turn
    pub fn user(context_id: ContextId, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: TurnRole::User,
            context_id,
            text: text.into(),
            state: None,
            at,
        }
    }

    /// Supervisor turn
    pub fn supervisor(
        context_id: ContextId,
        text: impl Into<String>,
        state: TaskState,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            role: TurnRole::Supervisor,
            context_id,
            text: text.into(),
            state: Some(state),
            at,
        }
    }
}

/// Append-only conversation log.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Start a thread; no-op if it exists
    async fn create(&self, thread_id: ThreadId, at: DateTime<Utc>);

    /// Append a turn, creating the thread if needed
    async fn append(&self, thread_id: ThreadId, turn: Turn);

    /// Turns in order, oldest first
    async fn history(&self, thread_id: &ThreadId) -> Vec<Turn>;

    /// Whether the thread exists
    async fn contains(&self, thread_id: &ThreadId) -> bool;

    /// Explicit teardown. Returns whether the thread existed.
    async fn remove(&self, thread_id: &ThreadId) -> bool;

    /// Drop threads idle since before `cutoff`. Returns the removed ids.
    async fn expire(&self, cutoff: DateTime<Utc>) -> Vec<ThreadId>;
}

#[derive(Debug)]
struct ThreadRecord {
    turns: Vec<Turn>,
    last_active: DateTime<Utc>,
}

/// In-memory store keeping the most recent `max_history` turns per thread.
#[derive(Debug)]
pub struct InMemoryThreadStore {
    threads: RwLock<HashMap<ThreadId, ThreadRecord>>,
    max_history: usize,
}

impl InMemoryThreadStore {
    /// Create a store
    pub fn new(max_history: usize) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            max_history: max_history.max(1),
        }
    }

    /// Number of live threads
    pub async fn len(&self) -> usize {
        self.threads.read().await.len()
    }

    /// Whether no thread is live
    pub async fn is_empty(&self) -> bool {
        self.threads.read().await.is_empty()
    }
}

impl Default for InMemoryThreadStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn create(&self, thread_id: ThreadId, at: DateTime<Utc>) {
        let mut threads = self.threads.write().await;
        threads.entry(thread_id).or_insert_with(|| ThreadRecord {
            turns: Vec::new(),
            last_active: at,
        });
    }

    async fn append(&self, thread_id: ThreadId, turn: Turn) {
        let mut threads = self.threads.write().await;
        let record = threads.entry(thread_id).or_insert_with(|| ThreadRecord {
            turns: Vec::new(),
            last_active: turn.at,
        });
        record.last_active = record.last_active.max(turn.at);
        record.turns.push(turn);

        if record.turns.len() > self.max_history {
            let excess = record.turns.len() - self.max_history;
            record.turns.drain(..excess);
        }
    }

    async fn history(&self, thread_id: &ThreadId) -> Vec<Turn> {
        let threads = self.threads.read().await;
        threads
            .get(thread_id)
            .map(|r| r.turns.clone())
            .unwrap_or_default()
    }

    async fn contains(&self, thread_id: &ThreadId) -> bool {
        self.threads.read().await.contains_key(thread_id)
    }

    async fn remove(&self, thread_id: &ThreadId) -> bool {
        self.threads.write().await.remove(thread_id).is_some()
    }

    async fn expire(&self, cutoff: DateTime<Utc>) -> Vec<ThreadId> {
        let mut threads = self.threads.write().await;
        let expired: Vec<ThreadId> = threads
            .iter()
            .filter(|(_, r)| r.last_active < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            threads.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = InMemoryThreadStore::new(3);
        let thread = ThreadId::new();
        let ctx = ContextId::new();
        for i in 0..5 {
            store
                .append(thread, Turn::user(ctx, format!("turn {i}"), at(1)))
                .await;
        }

        let history = store.history(&thread).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text, "turn 2");
        assert_eq!(history[2].text, "turn 4");
    }

    #[tokio::test]
    async fn test_expire_idle_threads() {
        let store = InMemoryThreadStore::default();
        let old = ThreadId::new();
        let fresh = ThreadId::new();
        store.create(old, at(1)).await;
        store.create(fresh, at(5)).await;

        let expired = store.expire(at(3)).await;
        assert_eq!(expired, vec![old]);
        assert!(!store.contains(&old).await);
        assert!(store.contains(&fresh).await);
    }

    #[tokio::test]
    async fn test_remove_is_teardown() {
        let store = InMemoryThreadStore::default();
        let thread = ThreadId::new();
        store
            .append(thread, Turn::user(ContextId::new(), "hi", at(1)))
            .await;
        assert!(store.remove(&thread).await);
        assert!(!store.remove(&thread).await);
        assert!(store.history(&thread).await.is_empty());
    }
}
