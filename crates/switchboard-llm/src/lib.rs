//! Switchboard LLM - completion service boundary
//!
//! The agent core never talks to a model vendor directly. Everything it needs
//! from a language model goes through [`CompletionProvider`]:
//! - prompt in, text out (`complete`)
//! - prompt in, streamed partial text out (`complete_stream`)
//! - failures and timeouts reported as [`Error`]
//!
//! [`MockProvider`] scripts responses for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod mock;
pub mod provider;

pub use error::{Error, Result};
pub use mock::MockProvider;
pub use provider::{
    ChatMessage, ChatRole, CompletionProvider, CompletionRequest, CompletionResponse,
    CompletionStream, TokenUsage,
};
