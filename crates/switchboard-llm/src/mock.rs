//! Scripted provider for tests.

use crate::error::{Error, Result};
use crate::provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum Scripted {
    Reply(Vec<String>),
    Fail(Error),
}

/// Mock provider returning queued replies in order.
///
/// When the queue is empty it answers `"mock response"`.
#[derive(Clone)]
pub struct MockProvider {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider").finish_non_exhaustive()
    }
}

impl MockProvider {
    /// Create a new mock provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a reply delivered as one chunk.
    pub fn add_response(&self, content: impl Into<String>) {
        self.push(Scripted::Reply(vec![content.into()]));
    }

    /// Queue a reply delivered as the given stream chunks.
    pub fn add_chunked_response<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Scripted::Reply(chunks.into_iter().map(Into::into).collect()));
    }

    /// Queue a failure.
    pub fn add_error(&self, error: Error) {
        self.push(Scripted::Fail(error));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push(&self, item: Scripted) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
    }

    fn next(&self, request: CompletionRequest) -> Result<Vec<String>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Scripted::Reply(chunks)) => Ok(chunks),
            Some(Scripted::Fail(e)) => Err(e),
            None => Ok(vec!["mock response".to_string()]),
        }
    }
}

#[async_trait::async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let chunks = self.next(request)?;
        Ok(CompletionResponse {
            content: chunks.concat(),
            usage: None,
            finish_reason: Some("stop".to_string()),
            model: "mock-model".to_string(),
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let chunks = self.next(request)?;
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}
