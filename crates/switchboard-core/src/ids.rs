//! Correlation identity.
//!
//! Four nested identifiers travel with every call:
//!
//! ```text
//! ThreadId ─┬─ ContextId ─┬─ TaskId ─── MessageId*
//!           │             └─ TaskId ─── MessageId*
//!           └─ ContextId ── ...
//! ```
//!
//! All of them are random 128-bit tokens (UUID v4), so minting needs no
//! central allocator. The only shared state is the table of open tasks per
//! context, which makes [`IdentityManager::derive_task`] idempotent.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! correlation_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// The underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

correlation_id!(
    /// One end-user conversation.
    ThreadId
);
correlation_id!(
    /// One routed request and its sub-agent responses.
    ContextId
);
correlation_id!(
    /// One unit of work performed by a single sub-agent.
    TaskId
);
correlation_id!(
    /// One message. Never reused.
    MessageId
);

/// Mints correlation identifiers and tracks the open task per context.
///
/// Each receiving agent owns one manager; task ids are only meaningful to the
/// agent that derived them.
#[derive(Debug, Default)]
pub struct IdentityManager {
    open_tasks: DashMap<ContextId, TaskId>,
}

impl IdentityManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a thread id.
    #[must_use]
    pub fn new_thread(&self) -> ThreadId {
        ThreadId::new()
    }

    /// Mint a context id.
    #[must_use]
    pub fn new_context(&self) -> ContextId {
        ContextId::new()
    }

    /// Mint a message id.
    #[must_use]
    pub fn new_message_id(&self) -> MessageId {
        MessageId::new()
    }

    /// Return the open task for `context_id`, minting one if none is open.
    ///
    /// The boolean is `true` when the task id was freshly minted.
    pub fn derive_task(&self, context_id: ContextId) -> (TaskId, bool) {
        let mut created = false;
        let task_id = *self.open_tasks.entry(context_id).or_insert_with(|| {
            created = true;
            TaskId::new()
        });
        (task_id, created)
    }

    /// The open task for a context, if any.
    #[must_use]
    pub fn open_task(&self, context_id: &ContextId) -> Option<TaskId> {
        self.open_tasks.get(context_id).map(|entry| *entry)
    }

    /// Forget the open task for a context once it is terminal.
    ///
    /// Only releases the entry if it still points at `task_id`.
    pub fn release(&self, context_id: &ContextId, task_id: &TaskId) {
        self.open_tasks
            .remove_if(context_id, |_, open| open == task_id);
    }

    /// Number of contexts with an open task.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open_tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_derive_task_is_idempotent() {
        let ids = IdentityManager::new();
        let ctx = ids.new_context();

        let (first, created_first) = ids.derive_task(ctx);
        let (second, created_second) = ids.derive_task(ctx);

        assert_eq!(first, second);
        assert!(created_first);
        assert!(!created_second);
    }

    #[test]
    fn test_distinct_contexts_get_distinct_tasks() {
        let ids = IdentityManager::new();
        let (a, _) = ids.derive_task(ids.new_context());
        let (b, _) = ids.derive_task(ids.new_context());
        assert_ne!(a, b);
        assert_eq!(ids.open_count(), 2);
    }

    #[test]
    fn test_release_allows_new_task() {
        let ids = IdentityManager::new();
        let ctx = ids.new_context();
        let (first, _) = ids.derive_task(ctx);

        ids.release(&ctx, &first);
        assert!(ids.open_task(&ctx).is_none());

        let (second, created) = ids.derive_task(ctx);
        assert!(created);
        assert_ne!(first, second);
    }

    #[test]
    fn test_release_ignores_stale_task() {
        let ids = IdentityManager::new();
        let ctx = ids.new_context();
        let (current, _) = ids.derive_task(ctx);

        ids.release(&ctx, &TaskId::new());
        assert_eq!(ids.open_task(&ctx), Some(current));
    }

    #[test]
    fn test_message_ids_unique() {
        let ids = IdentityManager::new();
        let minted: HashSet<MessageId> = (0..1000).map(|_| ids.new_message_id()).collect();
        assert_eq!(minted.len(), 1000);
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let ctx = ContextId::new();
        let parsed: ContextId = ctx.to_string().parse().unwrap();
        assert_eq!(parsed, ctx);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = TaskId::from_uuid(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
