//! Streaming event channel
//!
//! A subscription is a lazy, ordered, finite [`EventStream`] ending at the
//! task's next final status update. [`ResponseCollector`] consumes one and
//! applies the [`DedupPolicy`] to the final message.

mod collector;

pub use collector::{CollectedResponse, ResponseCollector};

use crate::protocol::TaskEvent;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Events of one task, in log order.
pub type EventStream = BoxStream<'static, TaskEvent>;

/// When a final status message is noise rather than content.
///
/// A resolution pipeline may emit the answer as an artifact and then close
/// the task with a short or empty acknowledgment. Surfacing both duplicates
/// user-visible text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupPolicy {
    /// Drop a blank final message once an artifact carried content
    #[serde(default = "default_true")]
    pub suppress_blank_final: bool,
    /// Drop a final message that repeats artifact content
    #[serde(default = "default_true")]
    pub suppress_repeated_final: bool,
    /// Treat whitespace-only messages as blank
    #[serde(default = "default_true")]
    pub whitespace_is_blank: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            suppress_blank_final: true,
            suppress_repeated_final: true,
            whitespace_is_blank: true,
        }
    }
}

impl DedupPolicy {
    /// Surface everything
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            suppress_blank_final: false,
            suppress_repeated_final: false,
            whitespace_is_blank: false,
        }
    }

    pub(crate) fn is_blank(&self, text: &str) -> bool {
        if self.whitespace_is_blank {
            text.trim().is_empty()
        } else {
            text.is_empty()
        }
    }

    /// Whether a final message with `text` should be hidden, given the
    /// content already surfaced through artifacts.
    #[must_use]
    pub fn suppresses(&self, text: &str, artifact_texts: &[String]) -> bool {
        let has_content = artifact_texts.iter().any(|t| !t.trim().is_empty());
        if self.is_blank(text) {
            return self.suppress_blank_final && has_content;
        }
        if self.suppress_repeated_final && has_content {
            let needle = text.trim();
            let combined = artifact_texts.concat();
            return combined.trim() == needle || artifact_texts.iter().any(|t| t.trim() == needle);
        }
        false
    }
}
