//! Agent-to-agent wire protocol.
//!
//! Every type here is what crosses the boundary between a caller and a
//! sub-agent, in-process or over HTTP:
//!
//! - [`Message`] / [`Part`]: request payloads and reply chunks
//! - [`Task`] / [`TaskState`] / [`TaskStatus`]: unit of work and its lifecycle
//! - [`Artifact`] / [`ArtifactChunk`]: streamed outputs
//! - [`TaskEvent`]: the tagged event union delivered to subscribers
//! - [`AgentDescriptor`] / [`Skill`]: capability discovery
//! - [`SendMessageRequest`] / [`CancelTaskRequest`] / [`ErrorBody`]: RPC envelopes

mod artifact;
mod descriptor;
mod event;
mod message;
mod rpc;
mod task;

pub use artifact::{Artifact, ArtifactChunk, ArtifactError};
pub use descriptor::{AgentDescriptor, Skill};
pub use event::{TaskArtifactUpdateEvent, TaskEvent, TaskStatusUpdateEvent};
pub use message::{Message, Part, Role};
pub use rpc::{CancelTaskRequest, ErrorBody, ErrorEnvelope, ErrorKind, SendMessageRequest};
pub use task::{Task, TaskState, TaskStatus};
