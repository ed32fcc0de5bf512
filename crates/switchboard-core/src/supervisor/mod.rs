//! Supervisor router
//!
//! Turns one user message into calls to the sub-agents whose skills match it
//! and merges their answers.
//!
//! ```text
//! route(thread, text)
//!   ├─ pending clarification? ── resume that task / resolve the choice
//!   ├─ match_request ─┬─ NoMatch / Unavailable ── failed (CapabilityUnavailable)
//!   │                 ├─ Ambiguous ────────────── input_required (question)
//!   │                 └─ Dispatch(candidates)
//!   └─ fan out (bounded, overall deadline) ── reflection per call ── render
//! ```
//!
//! The capability table is an immutable snapshot; [`SupervisorRouter::refresh`]
//! swaps it without touching requests already in flight.

mod aggregate;
mod matching;
mod registry;
mod thread;


pub use aggregate::{render, AggregatedResult, CapabilityFailure, Contribution, RouteError};
pub use matching::{match_request, Candidate, MatchOutcome};
pub use registry::{AgentEntry, CapabilityTable, CompiledSkill};
pub use thread::{InMemoryThreadStore, ThreadStore, Turn, TurnRole};

use crate::clock::{Clock, SystemClock};
use crate::connector::{CallContext, RemoteAgentConnector};
use crate::error::{format_error_for_chat, UserFriendlyError};
use crate::ids::{ContextId, IdentityManager, TaskId, ThreadId};
use crate::init::ReadinessReport;
use crate::protocol::{Message, Part, TaskState};
use crate::reflection::{FailureKind, ReflectionController};
use dashmap::DashMap;
use futures::{stream, StreamExt};
use matching::MENTION_REGEX;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Fan-in deadline for one routed request (seconds)
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,
    /// Sub-agent calls in flight at once per request
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Turns kept per thread
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Idle threads older than this are expired (seconds)
    #[serde(default = "default_thread_ttl_secs")]
    pub thread_ttl_secs: u64,
}

fn default_overall_timeout_secs() -> u64 {
    120
}

fn default_max_parallel() -> usize {
    8
}

fn default_max_history() -> usize {
    100
}

fn default_thread_ttl_secs() -> u64 {
    3600
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            overall_timeout_secs: default_overall_timeout_secs(),
            max_parallel: default_max_parallel(),
            max_history: default_max_history(),
            thread_ttl_secs: default_thread_ttl_secs(),
        }
    }
}

impl SupervisorConfig {
    /// Overall deadline as a `Duration`
    #[must_use]
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

#[derive(Debug, Clone)]
struct PendingTask {
    agent_id: String,
    tag: String,
    context_id: ContextId,
    task_id: TaskId,
}

/// What the thread's next message answers.
#[derive(Debug, Clone)]
enum Pending {
    /// Sub-agents asked for input
    Input(Vec<PendingTask>),
    /// The router asked which agent to use
    Choice {
        original: String,
        candidates: Vec<Candidate>,
    },
}

#[derive(Debug)]
struct Dispatch {
    connector: Arc<RemoteAgentConnector>,
    agent_name: String,
    tag: String,
    instruction: String,
    context_id: ContextId,
    task_id: Option<TaskId>,
}

enum Plan {
    Dispatch {
        context_id: ContextId,
        dispatches: Vec<Dispatch>,
    },
    Answer {
        context_id: ContextId,
        state: TaskState,
        text: String,
        error: RouteError,
    },
}

/// Routes user messages to sub-agents.
pub struct SupervisorRouter {
    table: RwLock<Arc<CapabilityTable>>,
    controller: ReflectionController,
    identity: IdentityManager,
    threads: Arc<dyn ThreadStore>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    pending: DashMap<ThreadId, Pending>,
    /// One token per in-flight request; a thread may have several
    inflight: DashMap<ThreadId, Vec<(u64, CancellationToken)>>,
    next_request: AtomicU64,
}

impl std::fmt::Debug for SupervisorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorRouter")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl SupervisorRouter {
    /// Create a router over `table`
    pub fn new(table: CapabilityTable, controller: ReflectionController, config: SupervisorConfig) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            controller,
            identity: IdentityManager::new(),
            threads: Arc::new(InMemoryThreadStore::new(config.max_history)),
            clock: Arc::new(SystemClock),
            config,
            pending: DashMap::new(),
            inflight: DashMap::new(),
            next_request: AtomicU64::new(0),
        }
    }

    /// Use a different thread store
    pub fn with_thread_store(mut self, threads: Arc<dyn ThreadStore>) -> Self {
        self.threads = threads;
        self
    }

    /// Use a different clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current capability table
    pub async fn capabilities(&self) -> Arc<CapabilityTable> {
        self.table.read().await.clone()
    }

    /// Replace the capability table from a fresh readiness report.
    pub async fn refresh(&self, report: &ReadinessReport) {
        let table = CapabilityTable::from_report(report);
        info!(agents = table.len(), "Capability table refreshed");
        *self.table.write().await = Arc::new(table);
    }

    /// Start a conversation
    pub async fn new_thread(&self) -> ThreadId {
        let thread_id = self.identity.new_thread();
        self.threads.create(thread_id, self.clock.now()).await;
        thread_id
    }

    /// Turns recorded for a thread
    pub async fn history(&self, thread_id: &ThreadId) -> Vec<Turn> {
        self.threads.history(thread_id).await
    }

    /// Whether the thread's next message answers a question
    #[must_use]
    pub fn awaiting_input(&self, thread_id: &ThreadId) -> bool {
        self.pending.contains_key(thread_id)
    }

    /// Route one user message.
    pub async fn route(&self, thread_id: ThreadId, text: &str) -> AggregatedResult {
        let started = Instant::now();
        let table = self.capabilities().await;
        self.threads.create(thread_id, self.clock.now()).await;

        let plan = self.plan(thread_id, &table, text).await;
        let result = match plan {
            Plan::Answer {
                context_id,
                state,
                text: answer,
                error,
            } => {
                self.threads
                    .append(thread_id, Turn::user(context_id, text, self.clock.now()))
                    .await;
                AggregatedResult {
                    thread_id,
                    context_id,
                    state,
                    text: answer,
                    contributions: Vec::new(),
                    failures: Vec::new(),
                    error: Some(error),
                }
            }
            Plan::Dispatch {
                context_id,
                dispatches,
            } => {
                self.threads
                    .append(thread_id, Turn::user(context_id, text, self.clock.now()))
                    .await;
                self.execute(thread_id, context_id, dispatches).await
            }
        };

        self.threads
            .append(
                thread_id,
                Turn::supervisor(result.context_id, result.text.clone(), result.state, self.clock.now()),
            )
            .await;

        info!(
            thread_id = %thread_id,
            context_id = %result.context_id,
            state = %result.state,
            contributions = result.contributions.len(),
            failures = result.failures.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Request routed"
        );
        result
    }

    /// Cancel whatever the thread is running or waiting on.
    ///
    /// Returns whether there was anything to cancel.
    pub async fn cancel_thread(&self, thread_id: &ThreadId) -> bool {
        let mut cancelled = false;
        if let Some(requests) = self.inflight.get(thread_id) {
            for (_, token) in requests.iter() {
                token.cancel();
            }
            cancelled = !requests.is_empty();
        }
        match self.pending.remove(thread_id) {
            Some((_, Pending::Input(tasks))) => {
                self.abandon(tasks).await;
                cancelled = true;
            }
            Some(_) => cancelled = true,
            None => {}
        }
        if cancelled {
            info!(thread_id = %thread_id, "Thread cancelled");
        }
        cancelled
    }

    /// Cancel and forget a thread.
    pub async fn end_thread(&self, thread_id: &ThreadId) -> bool {
        self.cancel_thread(thread_id).await;
        self.threads.remove(thread_id).await
    }

    /// Drop threads idle for longer than the configured TTL.
    pub async fn expire_threads(&self) -> usize {
        let now = self.clock.now();
        let cutoff = i64::try_from(self.config.thread_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let expired = self.threads.expire(cutoff).await;
        for thread_id in &expired {
            self.cancel_thread(thread_id).await;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired idle threads");
        }
        expired.len()
    }

    async fn plan(&self, thread_id: ThreadId, table: &CapabilityTable, text: &str) -> Plan {
        let mentions = MENTION_REGEX.is_match(text);

        match self.pending.remove(&thread_id).map(|(_, p)| p) {
            Some(Pending::Input(tasks)) if !mentions => {
                let context_id = tasks.first().map(|t| t.context_id);
                let dispatches: Vec<Dispatch> = tasks
                    .into_iter()
                    .filter_map(|t| {
                        let agent = table.agent(&t.agent_id)?;
                        Some(Dispatch {
                            connector: agent.connector.clone(),
                            agent_name: agent.name().to_string(),
                            tag: t.tag,
                            instruction: text.to_string(),
                            context_id: t.context_id,
                            task_id: Some(t.task_id),
                        })
                    })
                    .collect();
                if let (Some(context_id), false) = (context_id, dispatches.is_empty()) {
                    debug!(thread_id = %thread_id, tasks = dispatches.len(), "Resuming tasks awaiting input");
                    return Plan::Dispatch {
                        context_id,
                        dispatches,
                    };
                }
            }
            Some(Pending::Input(tasks)) => self.abandon(tasks).await,
            Some(Pending::Choice { original, candidates }) => {
                if let Some(chosen) = choose(table, &candidates, text) {
                    let context_id = self.identity.new_context();
                    let candidate = Candidate {
                        instruction: original,
                        ..chosen
                    };
                    if let Some(dispatch) = dispatch_for(table, candidate, context_id) {
                        return Plan::Dispatch {
                            context_id,
                            dispatches: vec![dispatch],
                        };
                    }
                }
            }
            None => {}
        }

        self.plan_fresh(thread_id, table, text)
    }

    fn plan_fresh(&self, thread_id: ThreadId, table: &CapabilityTable, text: &str) -> Plan {
        let context_id = self.identity.new_context();

        match match_request(table, text) {
            MatchOutcome::Dispatch(candidates) => {
                let dispatches: Vec<Dispatch> = candidates
                    .into_iter()
                    .filter_map(|c| dispatch_for(table, c, context_id))
                    .collect();
                if dispatches.is_empty() {
                    return unavailable(context_id, table, Vec::new());
                }
                Plan::Dispatch {
                    context_id,
                    dispatches,
                }
            }
            MatchOutcome::Ambiguous { tag, candidates } => {
                let mut question = format!("Several agents can handle '{}':", tag);
                for (i, c) in candidates.iter().enumerate() {
                    let (name, description) = table
                        .agent(&c.agent_id)
                        .map(|a| {
                            let description = a
                                .skills
                                .iter()
                                .find(|s| s.skill.tag == tag)
                                .map(|s| s.skill.description.clone())
                                .unwrap_or_default();
                            (a.name().to_string(), description)
                        })
                        .unwrap_or_else(|| (c.agent_id.clone(), String::new()));
                    question.push_str(&format!("\n{}. {} (@{}) {}", i + 1, name, c.agent_id, description));
                }
                question.push_str("\nWhich one should handle it?");

                info!(thread_id = %thread_id, tag = %tag, candidates = candidates.len(), "Ambiguous request");
                let error = RouteError::AmbiguousRequest {
                    tag,
                    candidates: candidates.iter().map(|c| c.agent_id.clone()).collect(),
                };
                self.pending.insert(
                    thread_id,
                    Pending::Choice {
                        original: text.to_string(),
                        candidates,
                    },
                );
                Plan::Answer {
                    context_id,
                    state: TaskState::InputRequired,
                    text: question.trim_end().to_string(),
                    error,
                }
            }
            MatchOutcome::Unavailable(requested) => unavailable(context_id, table, requested),
            MatchOutcome::NoMatch => unavailable(context_id, table, Vec::new()),
        }
    }

    async fn execute(&self, thread_id: ThreadId, context_id: ContextId, dispatches: Vec<Dispatch>) -> AggregatedResult {
        let cancel = CancellationToken::new();
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.inflight
            .entry(thread_id)
            .or_default()
            .push((request, cancel.clone()));

        let datetime = Part::data(serde_json::json!({
            "current_datetime": self.clock.now().to_rfc3339(),
            "timezone": "UTC",
        }));

        info!(
            thread_id = %thread_id,
            context_id = %context_id,
            agents = ?dispatches.iter().map(|d| d.connector.agent_id()).collect::<Vec<_>>(),
            "Dispatching request"
        );

        let calls = dispatches.iter().enumerate().map(|(index, dispatch)| {
            let ctx = CallContext {
                thread_id,
                context_id: dispatch.context_id,
                task_id: dispatch.task_id,
                cancel: cancel.child_token(),
            };
            let message = Message::caller_text(dispatch.instruction.clone()).with_part(datetime.clone());
            async move {
                let outcome = self.controller.invoke(&dispatch.connector, &ctx, message).await;
                (index, outcome)
            }
        }).collect::<Vec<_>>();

        let collected = stream::iter(calls)
            .buffer_unordered(self.config.max_parallel.max(1))
            .collect::<Vec<_>>();
        tokio::pin!(collected);

        let timeout = self.config.overall_timeout();
        let mut timed_out = false;
        let mut outcomes = tokio::select! {
            outcomes = &mut collected => outcomes,
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                warn!(
                    thread_id = %thread_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request deadline passed, cancelling outstanding calls"
                );
                cancel.cancel();
                collected.await
            }
        };
        if let Some(mut requests) = self.inflight.get_mut(&thread_id) {
            requests.retain(|(id, _)| *id != request);
        }
        self.inflight.remove_if(&thread_id, |_, requests| requests.is_empty());
        let canceled = cancel.is_cancelled() && !timed_out;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut contributions = Vec::new();
        let mut failures = Vec::new();
        let mut waiting = Vec::new();

        for (index, outcome) in outcomes {
            let dispatch = &dispatches[index];
            match outcome {
                Ok(response) => {
                    if response.state == TaskState::InputRequired {
                        waiting.push(PendingTask {
                            agent_id: dispatch.connector.agent_id().to_string(),
                            tag: dispatch.tag.clone(),
                            context_id: response.context_id,
                            task_id: response.task_id,
                        });
                    }
                    contributions.push(Contribution {
                        agent_id: dispatch.connector.agent_id().to_string(),
                        agent_name: dispatch.agent_name.clone(),
                        tag: dispatch.tag.clone(),
                        state: response.state,
                        text: response.text,
                        task_id: response.task_id,
                    });
                }
                Err(mut reason) => {
                    if timed_out && reason.kind == FailureKind::Canceled {
                        reason.detail = format!("no answer within {}s", timeout.as_secs());
                    }
                    failures.push(CapabilityFailure {
                        tag: dispatch.tag.clone(),
                        reason,
                    });
                }
            }
        }

        let (state, error, text) = if canceled {
            (
                TaskState::Canceled,
                Some(RouteError::Canceled),
                format_error_for_chat(&RouteError::Canceled),
            )
        } else if contributions.is_empty() {
            let error = if timed_out {
                RouteError::TimedOut
            } else {
                RouteError::AllFailed
            };
            let text = format!("{}\n\n{}", format_error_for_chat(&error), render(&[], &failures));
            (TaskState::Failed, Some(error), text)
        } else if !waiting.is_empty() {
            (TaskState::InputRequired, None, render(&contributions, &failures))
        } else {
            (TaskState::Completed, None, render(&contributions, &failures))
        };

        if state == TaskState::InputRequired {
            self.pending.insert(thread_id, Pending::Input(waiting));
        }

        AggregatedResult {
            thread_id,
            context_id,
            state,
            text,
            contributions,
            failures,
            error,
        }
    }

    async fn abandon(&self, tasks: Vec<PendingTask>) {
        let table = self.capabilities().await;
        for task in tasks {
            let Some(agent) = table.agent(&task.agent_id) else {
                continue;
            };
            match agent.connector.cancel(task.task_id).await {
                Ok(_) => debug!(agent_id = %task.agent_id, task_id = %task.task_id, "Abandoned task cancelled"),
                Err(e) => debug!(agent_id = %task.agent_id, task_id = %task.task_id, error = %e, "Abandoned task cancel failed"),
            }
        }
    }
}

fn dispatch_for(table: &CapabilityTable, candidate: Candidate, context_id: ContextId) -> Option<Dispatch> {
    let agent = table.agent(&candidate.agent_id)?;
    Some(Dispatch {
        connector: agent.connector.clone(),
        agent_name: agent.name().to_string(),
        tag: candidate.tag,
        instruction: candidate.instruction,
        context_id,
        task_id: None,
    })
}

/// Which of `candidates` the reply picks: by number, id or name.
fn choose(table: &CapabilityTable, candidates: &[Candidate], reply: &str) -> Option<Candidate> {
    if let Ok(n) = reply.trim().trim_end_matches('.').parse::<usize>() {
        return n.checked_sub(1).and_then(|i| candidates.get(i)).cloned();
    }

    let mentions = |word: &str| {
        Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).is_ok_and(|re| re.is_match(reply))
    };
    candidates
        .iter()
        .find(|c| {
            mentions(&c.agent_id)
                || table
                    .agent(&c.agent_id)
                    .is_some_and(|a| mentions(a.name()))
        })
        .cloned()
}

fn unavailable(context_id: ContextId, table: &CapabilityTable, requested: Vec<String>) -> Plan {
    let available = if !requested.is_empty() {
        let ids: Vec<&str> = table.agents().iter().map(AgentEntry::id).collect();
        if ids.is_empty() {
            "Available agents: none.".to_string()
        } else {
            format!("Available agents: {}.", ids.join(", "))
        }
    } else if table.is_empty() {
        "No agents are available right now.".to_string()
    } else {
        format!(
            "Available capabilities: {}.",
            table.tags().collect::<Vec<_>>().join(", ")
        )
    };

    let error = RouteError::CapabilityUnavailable { requested };
    let mut text = format!("{} {}", error.user_message(), available);
    if let Some(suggestion) = error.suggestion() {
        text.push_str("\n\n");
        text.push_str(&suggestion);
    }
    Plan::Answer {
        context_id,
        state: TaskState::Failed,
        text,
        error,
    }
}
