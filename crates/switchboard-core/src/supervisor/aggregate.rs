use crate::error::UserFriendlyError;
use crate::ids::{ContextId, TaskId, ThreadId};
use crate::protocol::TaskState;
use crate::reflection::FailureReason;
use serde::Serialize;
use std::fmt;

/// One sub-agent's usable answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    /// Source agent id
    pub agent_id: String,
    /// Source agent display name
    pub agent_name: String,
    /// Capability that was requested
    pub tag: String,
    /// `completed` or `input_required`
    pub state: TaskState,
    /// Answer text
    pub text: String,
    /// Remote task that produced it
    pub task_id: TaskId,
}

/// A capability that could not be fulfilled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityFailure {
    /// Capability that was requested
    pub tag: String,
    /// Why, including which agent
    pub reason: FailureReason,
}

/// Routing outcomes that are not sub-agent failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteError {
    /// No ready agent matches the request
    CapabilityUnavailable {
        /// Explicitly requested agents that are not available
        requested: Vec<String>,
    },
    /// Mutually exclusive interpretations; the caller must choose
    AmbiguousRequest {
        /// Contested capability
        tag: String,
        /// Competing agent ids
        candidates: Vec<String>,
    },
    /// Every dispatched call failed
    AllFailed,
    /// The overall deadline passed
    TimedOut,
    /// The thread's request was cancelled
    Canceled,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapabilityUnavailable { requested } if requested.is_empty() => {
                f.write_str("no available agent can handle this request")
            }
            Self::CapabilityUnavailable { requested } => {
                write!(f, "requested agents are not available: {}", requested.join(", "))
            }
            Self::AmbiguousRequest { tag, candidates } => {
                write!(f, "'{}' is offered by {}", tag, candidates.join(", "))
            }
            Self::AllFailed => f.write_str("every dispatched agent failed"),
            Self::TimedOut => f.write_str("the request did not finish in time"),
            Self::Canceled => f.write_str("the request was cancelled"),
        }
    }
}

impl std::error::Error for RouteError {}

impl UserFriendlyError for RouteError {
    fn user_message(&self) -> String {
        match self {
            Self::CapabilityUnavailable { requested } if requested.is_empty() => {
                "🤷 No available agent can handle this request.".to_string()
            }
            Self::CapabilityUnavailable { requested } => {
                format!("⚠️ Not available right now: {}.", requested.join(", "))
            }
            Self::AmbiguousRequest { tag, candidates } => format!(
                "❓ Several agents can handle '{}': {}.",
                tag,
                candidates.join(", ")
            ),
            Self::AllFailed => "❌ The request could not be completed.".to_string(),
            Self::TimedOut => "⏳ The request did not finish in time.".to_string(),
            Self::Canceled => "🛑 Request cancelled.".to_string(),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Self::CapabilityUnavailable { .. } => Some(
                "💡 Mention an agent with @id to address it directly, or rephrase the request."
                    .to_string(),
            ),
            Self::AmbiguousRequest { .. } => {
                Some("💡 Reply with a number or an agent name.".to_string())
            }
            Self::TimedOut => Some("💡 Ask again, or narrow the request.".to_string()),
            Self::AllFailed | Self::Canceled => None,
        }
    }
}

/// What the router hands back for one user message.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    /// Conversation
    pub thread_id: ThreadId,
    /// Request context
    pub context_id: ContextId,
    /// `completed`, `input_required`, `failed` or `canceled`
    pub state: TaskState,
    /// User-facing text
    pub text: String,
    /// Usable answers, in selection order
    pub contributions: Vec<Contribution>,
    /// Unfulfilled capabilities, in selection order
    pub failures: Vec<CapabilityFailure>,
    /// Set when the router itself could not produce an answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RouteError>,
}

impl AggregatedResult {
    /// Whether some capability could not be fulfilled
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.contributions.is_empty() && !self.failures.is_empty()
    }
}

/// Render contributions and failures as one answer.
pub fn render(contributions: &[Contribution], failures: &[CapabilityFailure]) -> String {
    let mut sections: Vec<String> = Vec::new();

    match contributions {
        [] => {}
        [single] => sections.push(single.text.trim().to_string()),
        many => {
            let mut table = String::from("| Agent | Capability | Status |\n|-------|------------|--------|");
            for c in many {
                table.push_str(&format!("\n| {} | {} | {} |", c.agent_name, c.tag, c.state));
            }
            for f in failures {
                table.push_str(&format!("\n| {} | {} | {} |", f.reason.agent_id, f.tag, TaskState::Failed));
            }
            sections.push(table);
            for c in many {
                sections.push(format!("### {}\n\n{}", c.agent_name, c.text.trim()));
            }
        }
    }

    if !failures.is_empty() {
        let notes = failures
            .iter()
            .map(|f| {
                format!(
                    "> ⚠ {} ({}) unavailable: {}",
                    f.tag,
                    f.reason.agent_id,
                    f.reason.user_message()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(notes);

        let mut suggestions: Vec<String> = Vec::new();
        for suggestion in failures.iter().filter_map(|f| f.reason.suggestion()) {
            if !suggestions.contains(&suggestion) {
                suggestions.push(suggestion);
            }
        }
        if !suggestions.is_empty() {
            sections.push(suggestions.join("\n"));
        }
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::FailureKind;

    fn contribution(agent: &str, tag: &str, text: &str) -> Contribution {
        Contribution {
            agent_id: agent.to_lowercase(),
            agent_name: agent.to_string(),
            tag: tag.to_string(),
            state: TaskState::Completed,
            text: text.to_string(),
            task_id: TaskId::new(),
        }
    }

    fn failure(agent: &str, tag: &str, detail: &str) -> CapabilityFailure {
        CapabilityFailure {
            tag: tag.to_string(),
            reason: FailureReason {
                agent_id: agent.to_string(),
                kind: FailureKind::UpstreamTool,
                detail: detail.to_string(),
                attempts: 2,
                task_id: None,
            },
        }
    }

    #[test]
    fn test_single_contribution_is_verbatim() {
        let text = render(&[contribution("Argo", "deployment.status", "all synced\n")], &[]);
        assert_eq!(text, "all synced");
    }

    #[test]
    fn test_multiple_contributions_are_tabulated() {
        let text = render(
            &[
                contribution("Argo", "deployment.status", "3 apps synced"),
                contribution("Jira", "tickets.query", "2 open tickets"),
            ],
            &[],
        );
        assert!(text.starts_with("| Agent | Capability | Status |"));
        assert!(text.contains("| Argo | deployment.status | completed |"));
        assert!(text.contains("### Argo\n\n3 apps synced"));
        assert!(text.contains("### Jira\n\n2 open tickets"));
        assert!(text.find("### Argo").unwrap() < text.find("### Jira").unwrap());
    }

    #[test]
    fn test_failures_are_visible() {
        let text = render(
            &[contribution("Argo", "deployment.status", "3 apps synced")],
            &[failure("pagerduty", "incidents.list", "HTTP 503 from api.pagerduty.com")],
        );
        assert!(text.starts_with("3 apps synced"));
        assert!(text.contains(
            "> ⚠ incidents.list (pagerduty) unavailable: HTTP 503 from api.pagerduty.com"
        ));
        assert!(text.ends_with("💡 Check the credentials and status of the external service."));
    }

    #[test]
    fn test_suggestions_listed_once() {
        let text = render(
            &[],
            &[
                failure("pagerduty", "incidents.list", "HTTP 503"),
                failure("jira", "tickets.query", "401 Unauthorized"),
            ],
        );
        assert_eq!(text.matches("💡").count(), 1);
    }

    #[test]
    fn test_route_error_user_messages() {
        assert_eq!(RouteError::Canceled.user_message(), "🛑 Request cancelled.");
        assert!(RouteError::Canceled.suggestion().is_none());
        let output = crate::error::format_error_for_chat(&RouteError::TimedOut);
        assert!(output.starts_with("⏳"));
        assert!(output.ends_with("narrow the request."));
    }

    #[test]
    fn test_route_error_messages() {
        assert_eq!(
            RouteError::CapabilityUnavailable { requested: vec![] }.to_string(),
            "no available agent can handle this request"
        );
        assert!(RouteError::CapabilityUnavailable {
            requested: vec!["jira".to_string()]
        }
        .to_string()
        .contains("jira"));
    }
}
