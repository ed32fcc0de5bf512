//! Reflection & retry controller
//!
//! Wraps one sub-agent call in [`retry_bounded`]. Each attempt is classified:
//!
//! | Outcome | Class |
//! |---------|-------|
//! | timeout, connection failure, stream cut short | `Retryable(Transport)` |
//! | `completed`, judged incomplete | `Retryable(Semantic)` |
//! | `failed` by an upstream tool | `Fatal` (the agent already retried it) |
//! | other `failed` with `"retryable": true` | `Retryable(Semantic)` |
//! | `completed` and satisfactory, `input_required` | `Done` |
//! | anything else | `Fatal` |
//!
//! Retries reissue the instruction with a fresh message id; semantic retries
//! also state why the previous answer fell short.

use crate::connector::{CallContext, RemoteAgentConnector};
use crate::error::{Error, UserFriendlyError};
use crate::ids::TaskId;
use crate::protocol::{Message, Part, TaskState};
use crate::stream::CollectedResponse;
use crate::utils::{retry_bounded, Attempt, AttemptInfo, RetryClass, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use switchboard_llm::{ChatMessage, CompletionProvider, CompletionRequest};
use tracing::{debug, warn};

/// Judgment of a completed result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Good enough to return
    Satisfactory,
    /// Worth another attempt, with the reason
    Incomplete(String),
}

/// Decides whether a completed result answers the instruction.
#[async_trait]
pub trait ResultJudge: Send + Sync {
    /// Assess `response` against `instruction`
    async fn assess(&self, instruction: &Message, response: &CollectedResponse) -> Verdict;
}

/// Judges from what the agent itself reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicJudge;

#[async_trait]
impl ResultJudge for HeuristicJudge {
    async fn assess(&self, _instruction: &Message, response: &CollectedResponse) -> Verdict {
        if response.text.trim().is_empty() && response.data.is_empty() {
            return Verdict::Incomplete("the agent returned no content".to_string());
        }
        if response.is_low_confidence() {
            let reason = response
                .data
                .iter()
                .find_map(|d| d.get("reason").and_then(Value::as_str))
                .unwrap_or("the agent reported low confidence");
            return Verdict::Incomplete(reason.to_string());
        }
        Verdict::Satisfactory
    }
}

const JUDGE_PROMPT: &str = "You review answers produced by an operations agent. \
Reply with SATISFACTORY if the response fully answers the request. \
Otherwise reply with INCOMPLETE: followed by one sentence naming what is missing.";

/// Asks the completion service, after the heuristic found nothing wrong.
///
/// A completion failure counts as satisfactory; the judge never fails a call.
pub struct LlmJudge {
    provider: Arc<dyn CompletionProvider>,
    model: String,
}

impl LlmJudge {
    /// Judge with the provider's default model
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        let model = provider.default_model().to_string();
        Self { provider, model }
    }

    /// Use a specific model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl ResultJudge for LlmJudge {
    async fn assess(&self, instruction: &Message, response: &CollectedResponse) -> Verdict {
        if let verdict @ Verdict::Incomplete(_) = HeuristicJudge.assess(instruction, response).await
        {
            return verdict;
        }

        let request = CompletionRequest::new(&self.model)
            .with_message(ChatMessage::system(JUDGE_PROMPT))
            .with_message(ChatMessage::user(format!(
                "Request:\n{}\n\nResponse:\n{}",
                instruction.text(),
                response.text
            )))
            .with_temperature(0.0);

        match self.provider.complete(request).await {
            Ok(reply) => parse_verdict(&reply.content),
            Err(e) => {
                warn!(provider = %self.provider.name(), error = %e, "Judge unavailable, accepting result");
                Verdict::Satisfactory
            }
        }
    }
}

fn parse_verdict(reply: &str) -> Verdict {
    let reply = reply.trim();
    let head = reply.get(..10).unwrap_or(reply);
    if head.eq_ignore_ascii_case("INCOMPLETE") {
        let reason = reply[10..].trim_start_matches([':', '-', ' ']).trim();
        if reason.is_empty() {
            Verdict::Incomplete("the reviewer judged the answer incomplete".to_string())
        } else {
            Verdict::Incomplete(reason.to_string())
        }
    } else {
        Verdict::Satisfactory
    }
}

/// Category of a surfaced failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts or connection failures outlasted the budget
    Transport,
    /// A domain tool inside the agent kept failing
    UpstreamTool,
    /// Answers stayed incomplete
    Incomplete,
    /// The agent failed for a reason it does not consider retryable
    AgentFailed,
    /// The agent has no record of the context or task
    UnknownContext,
    /// Cancelled by the caller or the agent
    Canceled,
    /// Malformed exchange
    Protocol,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transport => "transport",
            Self::UpstreamTool => "upstream tool",
            Self::Incomplete => "incomplete",
            Self::AgentFailed => "agent failed",
            Self::UnknownContext => "unknown context",
            Self::Canceled => "canceled",
            Self::Protocol => "protocol",
        })
    }
}

/// Typed reason a call did not produce a usable result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Agent that was called
    pub agent_id: String,
    /// Category
    pub kind: FailureKind,
    /// Human-readable detail; upstream error text is kept verbatim
    pub detail: String,
    /// Attempts made
    pub attempts: u32,
    /// Last remote task, if one was created
    pub task_id: Option<TaskId>,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} attempt{}): {}",
            self.agent_id,
            self.kind,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.detail
        )
    }
}

impl std::error::Error for FailureReason {}

impl UserFriendlyError for FailureReason {
    fn user_message(&self) -> String {
        match self.kind {
            FailureKind::Transport => format!("could not reach the agent ({})", self.detail),
            FailureKind::UnknownContext => {
                "the agent has no record of this conversation".to_string()
            }
            FailureKind::Protocol => format!("unexpected reply from the agent ({})", self.detail),
            FailureKind::UpstreamTool
            | FailureKind::Incomplete
            | FailureKind::AgentFailed
            | FailureKind::Canceled => self.detail.clone(),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self.kind {
            FailureKind::Transport => {
                Some("💡 Check that the agent is running and reachable.".to_string())
            }
            FailureKind::UpstreamTool => {
                Some("💡 Check the credentials and status of the external service.".to_string())
            }
            FailureKind::UnknownContext => {
                Some("💡 Send the request again to start a new task.".to_string())
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct AttemptFailure {
    kind: FailureKind,
    detail: String,
    task_id: Option<TaskId>,
}

/// Bounded retry around single sub-agent calls.
pub struct ReflectionController {
    config: RetryConfig,
    judge: Arc<dyn ResultJudge>,
}

impl fmt::Debug for ReflectionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReflectionController")
            .field("config", &self.config)
            .finish()
    }
}

impl Default for ReflectionController {
    fn default() -> Self {
        Self::new(RetryConfig::default(), Arc::new(HeuristicJudge))
    }
}

impl ReflectionController {
    /// Create a controller
    pub fn new(config: RetryConfig, judge: Arc<dyn ResultJudge>) -> Self {
        Self { config, judge }
    }

    /// Retry configuration in effect
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Call the agent behind `connector` until the result is usable or the
    /// budget is spent.
    pub async fn invoke(
        &self,
        connector: &RemoteAgentConnector,
        ctx: &CallContext,
        instruction: Message,
    ) -> std::result::Result<CollectedResponse, FailureReason> {
        let agent_id = connector.agent_id().to_string();

        let result = retry_bounded(&self.config, |info: AttemptInfo<AttemptFailure>| {
            let (message, call_ctx) = match &info.previous {
                None => (instruction.clone(), ctx.clone()),
                Some((RetryClass::Semantic, failure)) => {
                    let note = format!(
                        "The previous attempt was not sufficient: {}. Address this in your answer.",
                        failure.detail
                    );
                    let ctx = CallContext {
                        task_id: None,
                        ..ctx.clone()
                    };
                    (instruction.reissue().with_part(Part::text(note)), ctx)
                }
                Some((_, _)) => (
                    instruction.reissue(),
                    CallContext {
                        task_id: None,
                        ..ctx.clone()
                    },
                ),
            };
            let attempt = info.attempt;
            let agent_id = agent_id.as_str();
            let instruction = &instruction;

            async move {
                debug!(agent = %agent_id, attempt = attempt, "Invoking agent");
                match connector.call(&call_ctx, message).await {
                    Ok(response) => self.classify(instruction, response).await,
                    Err(e) => classify_error(e),
                }
            }
        })
        .await;

        result.map_err(|exhausted| {
            let failure = exhausted.last_error;
            warn!(
                agent = %agent_id,
                kind = %failure.kind,
                attempts = exhausted.attempts,
                detail = %failure.detail,
                "Agent call gave up"
            );
            FailureReason {
                agent_id,
                kind: failure.kind,
                detail: failure.detail,
                attempts: exhausted.attempts,
                task_id: failure.task_id,
            }
        })
    }

    async fn classify(
        &self,
        instruction: &Message,
        response: CollectedResponse,
    ) -> Attempt<CollectedResponse, AttemptFailure> {
        let task_id = Some(response.task_id);
        match response.state {
            TaskState::Completed => match self.judge.assess(instruction, &response).await {
                Verdict::Satisfactory => Attempt::Done(response),
                Verdict::Incomplete(reason) => Attempt::Retryable(
                    RetryClass::Semantic,
                    AttemptFailure {
                        kind: FailureKind::Incomplete,
                        detail: reason,
                        task_id,
                    },
                ),
            },
            TaskState::InputRequired => Attempt::Done(response),
            TaskState::Failed => {
                let kind = match response
                    .error_detail()
                    .and_then(|e| e.get("kind"))
                    .and_then(Value::as_str)
                {
                    Some("upstream_tool") => FailureKind::UpstreamTool,
                    _ => FailureKind::AgentFailed,
                };
                let failure = AttemptFailure {
                    kind,
                    detail: failure_text(&response),
                    task_id,
                };
                // The sub-agent spends the upstream tool budget itself.
                if kind != FailureKind::UpstreamTool && response.is_retryable_failure() {
                    Attempt::Retryable(RetryClass::Semantic, failure)
                } else {
                    Attempt::Fatal(failure)
                }
            }
            TaskState::Canceled => Attempt::Fatal(AttemptFailure {
                kind: FailureKind::Canceled,
                detail: "the agent cancelled the task".to_string(),
                task_id,
            }),
            state => Attempt::Fatal(AttemptFailure {
                kind: FailureKind::Protocol,
                detail: format!("turn ended in non-final state {state}"),
                task_id,
            }),
        }
    }
}

fn failure_text(response: &CollectedResponse) -> String {
    if !response.text.trim().is_empty() {
        return response.text.clone();
    }
    response
        .error_detail()
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("the agent failed without a reason")
        .to_string()
}

fn classify_error(error: Error) -> Attempt<CollectedResponse, AttemptFailure> {
    let detail = error.to_string();
    let failure = |kind| AttemptFailure {
        kind,
        detail: detail.clone(),
        task_id: None,
    };
    match &error {
        e if e.is_retryable() => Attempt::Retryable(RetryClass::Transport, failure(FailureKind::Transport)),
        Error::Cancelled => Attempt::Fatal(failure(FailureKind::Canceled)),
        Error::UnknownContext { .. } | Error::UnknownTask(_) => {
            Attempt::Fatal(failure(FailureKind::UnknownContext))
        }
        Error::UpstreamTool { .. } => Attempt::Fatal(failure(FailureKind::UpstreamTool)),
        _ => Attempt::Fatal(failure(FailureKind::Protocol)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorConfig, MockAgentTransport};
    use crate::error::TransportError;
    use crate::ids::{ContextId, ThreadId};
    use crate::protocol::{AgentDescriptor, SendMessageRequest, TaskEvent, TaskStatus, TaskStatusUpdateEvent};
    use crate::stream::DedupPolicy;
    use futures::stream::{self, StreamExt};
    use std::sync::Mutex;
    use std::time::Duration;
    use switchboard_llm::MockProvider;

    fn final_event(request: &SendMessageRequest, state: TaskState, message: Message) -> TaskEvent {
        TaskEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: request.task_id.unwrap_or_default(),
            context_id: request.context_id,
            seq: 1,
            status: TaskStatus::new(state, Some(message)),
            is_final: true,
        })
    }

    fn controller() -> ReflectionController {
        ReflectionController::new(
            RetryConfig::new()
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
            Arc::new(HeuristicJudge),
        )
    }

    fn connector(transport: MockAgentTransport) -> RemoteAgentConnector {
        RemoteAgentConnector::new(
            AgentDescriptor::new("jira", "Jira", "http://jira.local"),
            Arc::new(transport),
            ConnectorConfig::default(),
            DedupPolicy::default(),
        )
    }

    /// Transport answering each call with the next scripted outcome.
    fn scripted(
        outcomes: Vec<Result<(TaskState, Message), Error>>,
    ) -> (MockAgentTransport, Arc<Mutex<Vec<SendMessageRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let mut outcomes = outcomes.into_iter();
        let mut transport = MockAgentTransport::new();
        transport.expect_send_streaming().returning(move |request| {
            log.lock().unwrap().push(request.clone());
            match outcomes.next().expect("unexpected call") {
                Ok((state, message)) => {
                    let event = final_event(&request, state, message);
                    Ok(stream::iter(vec![event]).boxed())
                }
                Err(e) => Err(e),
            }
        });
        transport
            .expect_cancel_task()
            .returning(|id| Err(Error::UnknownTask(id)));
        (transport, seen)
    }

    fn ctx() -> CallContext {
        CallContext::new(ThreadId::new(), ContextId::new())
    }

    fn upstream_failure() -> Message {
        Message::agent_text("Upstream tool 'jira' failed after 2 attempts: 401 Unauthorized").with_part(
            Part::data(serde_json::json!({
                "error": {"kind": "upstream_tool", "tool": "jira", "message": "401 Unauthorized", "retryable": true}
            })),
        )
    }

    #[tokio::test]
    async fn test_transport_error_retried_once() {
        let (transport, seen) = scripted(vec![
            Err(TransportError::Connection("reset by peer".to_string()).into()),
            Ok((TaskState::Completed, Message::agent_text("2 open tickets"))),
        ]);
        let instruction = Message::caller_text("list open tickets");
        let response = controller()
            .invoke(&connector(transport), &ctx(), instruction.clone())
            .await
            .unwrap();

        assert_eq!(response.text, "2 open tickets");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].message.message_id, instruction.message_id);
        assert_ne!(seen[1].message.message_id, instruction.message_id);
        assert_eq!(seen[1].message.text(), "list open tickets");
    }

    #[tokio::test]
    async fn test_transport_budget_exhausted() {
        let (transport, seen) = scripted(vec![
            Err(TransportError::Timeout(Duration::from_secs(30)).into()),
            Err(TransportError::Timeout(Duration::from_secs(30)).into()),
        ]);
        let failure = controller()
            .invoke(&connector(transport), &ctx(), Message::caller_text("x"))
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Transport);
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.agent_id, "jira");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_low_confidence_triggers_semantic_retry_with_reason() {
        let low = Message::agent_text("maybe 3 tickets").with_part(Part::data(serde_json::json!({
            "confidence": "low",
            "reason": "project key was ambiguous"
        })));
        let (transport, seen) = scripted(vec![
            Ok((TaskState::Completed, low)),
            Ok((TaskState::Completed, Message::agent_text("3 tickets in OPS"))),
        ]);
        let response = controller()
            .invoke(&connector(transport), &ctx(), Message::caller_text("count tickets"))
            .await
            .unwrap();

        assert_eq!(response.text, "3 tickets in OPS");
        let retried = seen.lock().unwrap()[1].message.text();
        assert!(retried.starts_with("count tickets"));
        assert!(retried.contains("project key was ambiguous"));
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces_verbatim_without_new_task() {
        let (transport, seen) = scripted(vec![Ok((TaskState::Failed, upstream_failure()))]);
        let failure = controller()
            .invoke(&connector(transport), &ctx(), Message::caller_text("x"))
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::UpstreamTool);
        assert!(failure.detail.contains("401 Unauthorized"));
        assert_eq!(failure.attempts, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_agent_failure_gets_semantic_retry() {
        let flaky = Message::agent_text("index is rebuilding").with_part(Part::data(serde_json::json!({
            "error": {"kind": "unavailable", "message": "index is rebuilding", "retryable": true}
        })));
        let (transport, seen) = scripted(vec![
            Ok((TaskState::Failed, flaky)),
            Ok((TaskState::Completed, Message::agent_text("4 runbooks match"))),
        ]);
        let response = controller()
            .invoke(&connector(transport), &ctx(), Message::caller_text("runbooks for redis"))
            .await
            .unwrap();

        assert_eq!(response.text, "4 runbooks match");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_context_is_fatal() {
        let context_id = ContextId::new();
        let (transport, seen) = scripted(vec![Err(Error::UnknownContext {
            context_id,
            task_id: None,
        })]);
        let failure = controller()
            .invoke(&connector(transport), &ctx(), Message::caller_text("x"))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::UnknownContext);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_input_required_is_returned() {
        let (transport, _) = scripted(vec![Ok((
            TaskState::InputRequired,
            Message::agent_text("Which cluster?"),
        ))]);
        let response = controller()
            .invoke(&connector(transport), &ctx(), Message::caller_text("sync"))
            .await
            .unwrap();
        assert_eq!(response.state, TaskState::InputRequired);
        assert_eq!(response.text, "Which cluster?");
    }

    #[tokio::test]
    async fn test_llm_judge_parses_incomplete() {
        let provider = Arc::new(MockProvider::new());
        provider.add_response("INCOMPLETE: totals per project are missing");
        let judge = LlmJudge::new(provider.clone());

        let response = CollectedResponse {
            task_id: TaskId::new(),
            context_id: ContextId::new(),
            state: TaskState::Completed,
            text: "OPS-1, OPS-2".to_string(),
            artifacts: Vec::new(),
            status_message: None,
            data: Vec::new(),
            progress: Vec::new(),
        };
        let verdict = judge
            .assess(&Message::caller_text("tickets per project"), &response)
            .await;
        assert_eq!(
            verdict,
            Verdict::Incomplete("totals per project are missing".to_string())
        );
        assert!(provider.requests()[0].messages[1]
            .content
            .contains("tickets per project"));
    }

    #[tokio::test]
    async fn test_llm_judge_falls_back_on_error() {
        let provider = Arc::new(MockProvider::new());
        provider.add_error(switchboard_llm::Error::Network("unreachable".to_string()));
        let judge = LlmJudge::new(provider);

        let response = CollectedResponse {
            task_id: TaskId::new(),
            context_id: ContextId::new(),
            state: TaskState::Completed,
            text: "done".to_string(),
            artifacts: Vec::new(),
            status_message: None,
            data: Vec::new(),
            progress: Vec::new(),
        };
        assert_eq!(
            judge.assess(&Message::caller_text("x"), &response).await,
            Verdict::Satisfactory
        );
    }

    #[test]
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("SATISFACTORY"), Verdict::Satisfactory);
        assert_eq!(parse_verdict("  incomplete - no dates"), Verdict::Incomplete("no dates".to_string()));
        assert!(matches!(parse_verdict("INCOMPLETE"), Verdict::Incomplete(_)));
    }
}
