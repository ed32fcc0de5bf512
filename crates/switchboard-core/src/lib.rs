//! Switchboard Core - agent task execution and inter-agent RPC
//!
//! This crate provides everything between a user's request and the
//! sub-agents that resolve it:
//! - Identity: thread / context / task / message correlation ids
//! - Tasks: lifecycle state machine, event log, executor seam
//! - Streaming: ordered per-task event streams and response collection
//! - Connector: calling a sub-agent in-process or over HTTP
//! - RPC: the HTTP surface a sub-agent exposes
//! - Reflection: bounded retry with result assessment
//! - Supervisor: capability matching, fan-out, aggregation, threads
//! - Init: concurrent sub-agent bring-up

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod executor;
pub mod ids;
pub mod init;
pub mod protocol;
pub mod reflection;
pub mod rpc;
pub mod stream;
pub mod supervisor;
pub mod task;
pub mod utils;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AgentConfig, SwitchboardConfig};
pub use connector::{
    AgentTransport, CallContext, ConnectorConfig, HttpTransport, LocalTransport,
    RemoteAgentConnector,
};
pub use error::{format_error_for_chat, Error, Result, TransportError, UserFriendlyError};
pub use executor::LlmAgentExecutor;
pub use ids::{ContextId, IdentityManager, MessageId, TaskId, ThreadId};
pub use init::{initialize, AgentEndpoint, Readiness, ReadinessEntry, ReadinessReport};
pub use protocol::{
    AgentDescriptor, Artifact, ArtifactChunk, Message, Part, Role, Skill, Task, TaskEvent,
    TaskState, TaskStatus,
};
pub use reflection::{
    FailureKind, FailureReason, HeuristicJudge, LlmJudge, ReflectionController, ResultJudge,
    Verdict,
};
pub use stream::{CollectedResponse, DedupPolicy, EventStream, ResponseCollector};
pub use supervisor::{
    AggregatedResult, CapabilityTable, InMemoryThreadStore, RouteError, SupervisorConfig,
    SupervisorRouter, ThreadStore,
};
pub use task::{
    AgentExecutor, ExecutionOutcome, ExecutorError, RequestContext, TaskConfig, TaskManager,
    TaskUpdater,
};
pub use utils::{RetryBudget, RetryClass, RetryConfig};
