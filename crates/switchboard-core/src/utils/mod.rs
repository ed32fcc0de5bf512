//! Utility modules for switchboard-core
//!
//! - retry: bounded retry combinator with exponential backoff

mod retry;

pub use retry::{retry_bounded, Attempt, AttemptInfo, Exhausted, RetryBudget, RetryClass, RetryConfig};
