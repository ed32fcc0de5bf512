//! Reference resolution logic over the completion service.
//!
//! The model's reply is streamed to the caller as one `answer` artifact, one
//! line at a time. Two line markers are recognised:
//!
//! - `NEEDS_INPUT: <question>` as the first line turns the turn into
//!   `input_required`; nothing is streamed.
//! - `CONFIDENCE: low [- reason]` anywhere is removed from the answer and
//!   reported as a `{"confidence": "low"}` data part on the closing message.

use crate::clock::{Clock, SystemClock};
use crate::protocol::{AgentDescriptor, Message, Part, Role};
use crate::task::{AgentExecutor, ArtifactWriter, ExecutionOutcome, ExecutorError, RequestContext, TaskUpdater};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};
use switchboard_llm::{ChatMessage, CompletionProvider, CompletionRequest};
use tracing::debug;

const NEEDS_INPUT: &str = "NEEDS_INPUT:";

static CONFIDENCE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*CONFIDENCE:\s*(\w+)(?:\s*[-:]\s*(.+?))?\s*$")
        .expect("CONFIDENCE_LINE is a compile-time constant")
});

/// Sub-agent logic that answers with a language model.
pub struct LlmAgentExecutor {
    provider: Arc<dyn CompletionProvider>,
    descriptor: AgentDescriptor,
    clock: Arc<dyn Clock>,
    model: Option<String>,
    max_tokens: u32,
}

impl std::fmt::Debug for LlmAgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAgentExecutor")
            .field("agent", &self.descriptor.id)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .finish()
    }
}

impl LlmAgentExecutor {
    /// Executor for the agent described by `descriptor`
    pub fn new(provider: Arc<dyn CompletionProvider>, descriptor: AgentDescriptor) -> Self {
        Self {
            provider,
            descriptor,
            clock: Arc::new(SystemClock),
            model: None,
            max_tokens: 2048,
        }
    }

    /// Override the provider's default model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Use a different clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Output token limit
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn system_prompt(&self, ctx: &RequestContext) -> String {
        let now = ctx
            .message
            .data()
            .find_map(|d| d.get("current_datetime").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| self.clock.now().to_rfc3339());

        let mut prompt = format!("You are {}.", self.descriptor.name);
        if !self.descriptor.description.is_empty() {
            prompt.push(' ');
            prompt.push_str(&self.descriptor.description);
        }
        if !self.descriptor.skills.is_empty() {
            prompt.push_str("\n\nYou can:");
            for skill in &self.descriptor.skills {
                prompt.push_str(&format!("\n- {}: {}", skill.tag, skill.description));
            }
        }
        prompt.push_str(&format!(
            "\n\nCurrent date and time: {now} (UTC). Resolve relative dates against it.\n\
             If you cannot answer without more information, reply with a single first line \
             `{NEEDS_INPUT} <question>`.\n\
             If you are unsure of your answer, add a final line `CONFIDENCE: low - <reason>`."
        ));
        if let Some(previous) = &ctx.previous_error {
            prompt.push_str(&format!("\n\nThe previous attempt failed: {previous}"));
        }
        prompt
    }

    fn request(&self, ctx: &RequestContext) -> CompletionRequest {
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());

        let mut messages = vec![ChatMessage::system(self.system_prompt(ctx))];
        let history = if ctx.history.is_empty() {
            std::slice::from_ref(&ctx.message)
        } else {
            ctx.history.as_slice()
        };
        messages.extend(history.iter().filter_map(|m| {
            let text = m.text();
            if text.trim().is_empty() {
                return None;
            }
            Some(match m.role {
                Role::Caller => ChatMessage::user(text),
                Role::Agent => ChatMessage::assistant(text),
            })
        }));

        CompletionRequest::new(model)
            .with_messages(messages)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.2)
    }
}

#[async_trait]
impl AgentExecutor for LlmAgentExecutor {
    async fn execute(
        &self,
        ctx: RequestContext,
        updater: TaskUpdater,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let request = self.request(&ctx);
        debug!(
            agent = %self.descriptor.id,
            task_id = %ctx.task_id,
            attempt = ctx.attempt,
            messages = request.messages.len(),
            "Requesting completion"
        );

        let mut stream = self.provider.complete_stream(request).await.map_err(completion_error)?;
        let mut filter = OutputFilter::default();
        let mut writer: Option<ArtifactWriter> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(completion_error)?;
            if let Some(ready) = filter.push(&chunk) {
                writer
                    .get_or_insert_with(|| updater.artifact("answer"))
                    .append_text(ready)
                    .await?;
            }
        }

        match filter.finish() {
            Filtered::Question(question) => {
                let question = if question.is_empty() {
                    "Could you give me more details?".to_string()
                } else {
                    question
                };
                Ok(ExecutionOutcome::ask(question))
            }
            Filtered::Answer { tail, confidence } => {
                match writer {
                    Some(writer) => writer.finish(vec![Part::text(tail)]).await?,
                    None if !tail.trim().is_empty() => {
                        updater.artifact("answer").finish(vec![Part::text(tail)]).await?;
                    }
                    None => {}
                }
                let mut message = Message::agent_text("");
                if let Some(confidence) = confidence {
                    message = message.with_part(Part::data(confidence));
                }
                Ok(ExecutionOutcome::Completed {
                    message: Some(message),
                })
            }
        }
    }
}

fn completion_error(error: switchboard_llm::Error) -> ExecutorError {
    if error.is_transient() {
        ExecutorError::upstream("completion", error.to_string())
    } else {
        ExecutorError::Unrecoverable(format!("completion service: {error}"))
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Undecided,
    Answer,
    Question,
}

#[derive(Debug, PartialEq)]
enum Filtered {
    Question(String),
    Answer {
        tail: String,
        confidence: Option<Value>,
    },
}

/// Splits streamed model output into answer text and line markers.
#[derive(Debug, Default)]
struct OutputFilter {
    buffer: String,
    mode: Mode,
    confidence: Option<Value>,
}

impl OutputFilter {
    /// Feed a chunk; returns whole lines ready to stream.
    fn push(&mut self, chunk: &str) -> Option<String> {
        self.buffer.push_str(chunk);

        if self.mode == Mode::Undecided {
            let head = self.buffer.trim_start();
            if head.len() < NEEDS_INPUT.len() && !head.contains('\n') {
                return None;
            }
            self.mode = if is_question(head) {
                Mode::Question
            } else {
                Mode::Answer
            };
        }

        if self.mode != Mode::Answer {
            return None;
        }
        let end = self.buffer.rfind('\n')? + 1;
        let lines: String = self.buffer.drain(..end).collect();
        let kept = self.strip_markers(&lines);
        (!kept.is_empty()).then_some(kept)
    }

    fn finish(mut self) -> Filtered {
        if self.mode == Mode::Undecided && is_question(self.buffer.trim_start()) {
            self.mode = Mode::Question;
        }
        if self.mode == Mode::Question {
            let question = self.buffer.trim_start()[NEEDS_INPUT.len()..].trim().to_string();
            return Filtered::Question(question);
        }
        let rest = std::mem::take(&mut self.buffer);
        let tail = self.strip_markers(&rest);
        Filtered::Answer {
            tail,
            confidence: self.confidence,
        }
    }

    fn strip_markers(&mut self, text: &str) -> String {
        let mut kept = String::with_capacity(text.len());
        for line in text.split_inclusive('\n') {
            match CONFIDENCE_LINE.captures(line.trim_end_matches(['\n', '\r'])) {
                Some(caps) => {
                    let level = caps.get(1).map_or("", |m| m.as_str()).to_lowercase();
                    let mut marker = json!({ "confidence": level });
                    if let Some(reason) = caps.get(2) {
                        marker["reason"] = Value::String(reason.as_str().to_string());
                    }
                    if level == "low" || self.confidence.is_none() {
                        self.confidence = Some(marker);
                    }
                }
                None => kept.push_str(line),
            }
        }
        kept
    }
}

fn is_question(head: &str) -> bool {
    head.get(..NEEDS_INPUT.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(NEEDS_INPUT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ids::ContextId;
    use crate::protocol::{SendMessageRequest, Skill, TaskState};
    use crate::stream::{CollectedResponse, DedupPolicy};
    use crate::task::{TaskConfig, TaskManager};
    use chrono::TimeZone;
    use switchboard_llm::MockProvider;

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor::new("pagerduty", "PagerDuty", "local://pagerduty")
            .with_description("Incident management.")
            .with_skill(Skill::new("incidents.list", "List incidents in a time window"))
    }

    fn manager(provider: Arc<MockProvider>) -> Arc<TaskManager> {
        let clock = FixedClock(chrono::Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap());
        let executor = LlmAgentExecutor::new(provider, descriptor()).with_clock(Arc::new(clock));
        Arc::new(TaskManager::with_config(
            descriptor(),
            Arc::new(executor),
            TaskConfig {
                retry_delay_ms: 1,
                ..TaskConfig::default()
            },
        ))
    }

    async fn ask(manager: &Arc<TaskManager>, text: &str) -> CollectedResponse {
        let task = manager
            .send_message(SendMessageRequest {
                context_id: ContextId::new(),
                task_id: None,
                message: Message::caller_text(text),
            })
            .await
            .unwrap();
        CollectedResponse::from_task(task, &DedupPolicy::default())
    }

    #[test]
    fn test_filter_streams_whole_lines() {
        let mut filter = OutputFilter::default();
        assert_eq!(filter.push("Two inci"), None);
        assert_eq!(filter.push("dents:\n- INC-1"), Some("Two incidents:\n".to_string()));
        assert_eq!(filter.push("\n- INC-2"), Some("- INC-1\n".to_string()));
        assert_eq!(
            filter.finish(),
            Filtered::Answer {
                tail: "- INC-2".to_string(),
                confidence: None
            }
        );
    }

    #[test]
    fn test_filter_question() {
        let mut filter = OutputFilter::default();
        assert_eq!(filter.push("needs_input: which"), None);
        assert_eq!(filter.push(" service?\nignored"), None);
        assert_eq!(
            filter.finish(),
            Filtered::Question("which service?\nignored".to_string())
        );
    }

    #[test]
    fn test_filter_confidence_marker_removed() {
        let mut filter = OutputFilter::default();
        assert_eq!(
            filter.push("Probably INC-7.\nCONFIDENCE: low - no timestamps\n"),
            Some("Probably INC-7.\n".to_string())
        );
        match filter.finish() {
            Filtered::Answer { tail, confidence } => {
                assert!(tail.is_empty());
                let confidence = confidence.unwrap();
                assert_eq!(confidence["confidence"], "low");
                assert_eq!(confidence["reason"], "no timestamps");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_short_answer_decided_at_finish() {
        let mut filter = OutputFilter::default();
        assert_eq!(filter.push("None."), None);
        assert_eq!(
            filter.finish(),
            Filtered::Answer {
                tail: "None.".to_string(),
                confidence: None
            }
        );
    }

    #[tokio::test]
    async fn test_answer_streams_as_artifact() {
        let provider = Arc::new(MockProvider::new());
        provider.add_chunked_response(["Two incidents", " yesterday:\n", "- INC-1\n- INC-2"]);
        let manager = manager(provider.clone());

        let response = ask(&manager, "what happened yesterday?").await;

        assert_eq!(response.state, TaskState::Completed);
        assert_eq!(response.text, "Two incidents yesterday:\n- INC-1\n- INC-2");
        assert_eq!(response.artifacts.len(), 1);
        assert!(response.artifacts[0].chunks >= 2);

        let request = &provider.requests()[0];
        let system = &request.messages[0].content;
        assert!(system.contains("2024-05-02T08:30:00+00:00"));
        assert!(system.contains("incidents.list"));
        assert_eq!(request.messages[1].content, "what happened yesterday?");
    }

    #[tokio::test]
    async fn test_injected_datetime_wins_over_clock() {
        let provider = Arc::new(MockProvider::new());
        let manager = manager(provider.clone());

        manager
            .send_message(SendMessageRequest {
                context_id: ContextId::new(),
                task_id: None,
                message: Message::caller_text("incidents today?").with_part(Part::data(json!({
                    "current_datetime": "2030-01-01T00:00:00+00:00",
                    "timezone": "UTC"
                }))),
            })
            .await
            .unwrap();

        assert!(provider.requests()[0].messages[0]
            .content
            .contains("2030-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_needs_input() {
        let provider = Arc::new(MockProvider::new());
        provider.add_response("NEEDS_INPUT: Which service?");
        let manager = manager(provider);

        let response = ask(&manager, "list incidents").await;

        assert_eq!(response.state, TaskState::InputRequired);
        assert_eq!(response.text, "Which service?");
        assert!(response.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_low_confidence_marker() {
        let provider = Arc::new(MockProvider::new());
        provider.add_response("Maybe INC-9.\nCONFIDENCE: low");
        let manager = manager(provider);

        let response = ask(&manager, "latest incident?").await;

        assert_eq!(response.text, "Maybe INC-9.\n");
        assert!(response.is_low_confidence());
    }

    #[tokio::test]
    async fn test_transient_error_is_upstream_and_retried() {
        let provider = Arc::new(MockProvider::new());
        provider.add_error(switchboard_llm::Error::RateLimit);
        provider.add_response("No incidents.");
        let manager = manager(provider.clone());

        let response = ask(&manager, "incidents?").await;

        assert_eq!(response.state, TaskState::Completed);
        assert_eq!(response.text, "No incidents.");
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_fails() {
        let provider = Arc::new(MockProvider::new());
        provider.add_error(switchboard_llm::Error::NotConfigured("no api key".to_string()));
        let manager = manager(provider.clone());

        let response = ask(&manager, "incidents?").await;

        assert_eq!(response.state, TaskState::Failed);
        assert!(response.text.contains("no api key"));
        assert!(!response.is_retryable_failure());
        assert_eq!(provider.requests().len(), 1);
    }
}
