use crate::ids::{ContextId, MessageId, TaskId};
use serde::{Deserialize, Serialize};

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The party that opened the task (supervisor or end user)
    Caller,
    /// The sub-agent performing the task
    Agent,
}

/// One content part of a message or artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    /// Plain text
    Text {
        /// Text content
        text: String,
    },
    /// Structured data
    Data {
        /// JSON payload
        data: serde_json::Value,
    },
}

impl Part {
    /// Text part
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Data part
    pub fn data(data: serde_json::Value) -> Self {
        Self::Data { data }
    }

    /// Text content, if this is a text part
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Data { .. } => None,
        }
    }

    /// Data payload, if this is a data part
    #[must_use]
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data { data } => Some(data),
            Self::Text { .. } => None,
        }
    }
}

/// Append `part`, merging it into a trailing text part when both are text.
pub(crate) fn push_part(parts: &mut Vec<Part>, part: Part) {
    if let (Some(Part::Text { text: tail }), Part::Text { text }) = (parts.last_mut(), &part) {
        tail.push_str(text);
        return;
    }
    parts.push(part);
}

/// One unit of communication. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub message_id: MessageId,
    /// Sender role
    pub role: Role,
    /// Ordered content parts
    pub parts: Vec<Part>,
    /// Context this message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    /// Task this message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            message_id: MessageId::new(),
            role,
            parts,
            context_id: None,
            task_id: None,
        }
    }

    /// Caller message with a single text part
    pub fn caller_text(text: impl Into<String>) -> Self {
        Self::new(Role::Caller, vec![Part::text(text)])
    }

    /// Agent message with a single text part
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, vec![Part::text(text)])
    }

    /// Add a part
    #[must_use]
    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Attach context id
    #[must_use]
    pub fn with_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    /// Attach task id
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Same content under a new message id.
    #[must_use]
    pub fn reissue(&self) -> Self {
        Self {
            message_id: MessageId::new(),
            ..self.clone()
        }
    }

    /// Text parts joined by newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Data payloads in order.
    pub fn data(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.parts.iter().filter_map(Part::as_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_wire_format() {
        let json = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(json, json!({"kind": "text", "text": "hi"}));

        let json = serde_json::to_value(Part::data(json!({"a": 1}))).unwrap();
        assert_eq!(json, json!({"kind": "data", "data": {"a": 1}}));
    }

    #[test]
    fn test_message_text_skips_data() {
        let msg = Message::caller_text("list tickets")
            .with_part(Part::data(json!({"current_datetime": "2026-01-01T00:00:00Z"})))
            .with_part(Part::text("assigned to me"));
        assert_eq!(msg.text(), "list tickets\nassigned to me");
        assert_eq!(msg.data().count(), 1);
    }

    #[test]
    fn test_push_part_merges_text() {
        let mut parts = Vec::new();
        push_part(&mut parts, Part::text("ab"));
        push_part(&mut parts, Part::text("cd"));
        push_part(&mut parts, Part::data(json!(1)));
        push_part(&mut parts, Part::text("ef"));
        assert_eq!(
            parts,
            vec![Part::text("abcd"), Part::data(json!(1)), Part::text("ef")]
        );
    }

    #[test]
    fn test_reissue_changes_only_id() {
        let original = Message::caller_text("sync prod");
        let copy = original.reissue();
        assert_ne!(copy.message_id, original.message_id);
        assert_eq!(copy.parts, original.parts);
    }

    #[test]
    fn test_optional_ids_omitted() {
        let json = serde_json::to_value(Message::agent_text("ok")).unwrap();
        assert!(json.get("context_id").is_none());
        assert_eq!(json["role"], "agent");
    }
}
