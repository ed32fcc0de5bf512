use super::AgentTransport;
use crate::error::{Error, Result, TransportError};
use crate::ids::TaskId;
use crate::protocol::{AgentDescriptor, CancelTaskRequest, ErrorEnvelope, SendMessageRequest, Task, TaskEvent};
use crate::stream::EventStream;
use async_trait::async_trait;
use futures::future;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::warn;

const MAX_ERROR_BODY: usize = 512;
/// Longest event line accepted from a stream
const MAX_EVENT_LINE: usize = 8 * 1024 * 1024;

/// Calls an agent over the HTTP RPC surface.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Transport for the agent at `base_url`.
    ///
    /// `request_timeout` bounds connection setup and non-streaming requests;
    /// streams are bounded by the connector's call timeout.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_err(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            TransportError::Timeout(self.request_timeout).into()
        } else if e.is_decode() {
            TransportError::Decode(e.to_string()).into()
        } else {
            TransportError::Connection(e.to_string()).into()
        }
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let response = check(response).await?;
        response.json::<T>().await.map_err(|e| self.map_err(e))
    }

    async fn post_json<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.json(response).await
    }

    async fn open_stream(&self, request: reqwest::RequestBuilder) -> Result<EventStream> {
        let response = request
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(ndjson_events(check(response).await?))
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn fetch_descriptor(&self) -> Result<AgentDescriptor> {
        let response = self
            .client
            .get(self.url("/.well-known/agent.json"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.json(response).await
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<Task> {
        // Blocking sends last as long as the task; the caller bounds them.
        let response = self
            .client
            .post(self.url("/v1/message/send"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.json(response).await
    }

    async fn send_streaming(&self, request: SendMessageRequest) -> Result<EventStream> {
        self.open_stream(self.client.post(self.url("/v1/message/stream")).json(&request))
            .await
    }

    async fn subscribe(&self, task_id: TaskId) -> Result<EventStream> {
        self.open_stream(
            self.client
                .get(self.url(&format!("/v1/tasks/{task_id}/subscribe"))),
        )
        .await
    }

    async fn cancel_task(&self, task_id: TaskId) -> Result<Task> {
        self.post_json(
            &format!("/v1/tasks/{task_id}/cancel"),
            &CancelTaskRequest { task_id },
        )
        .await
    }
}

/// Turn a non-2xx response into a typed error.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return Err(envelope.error.into_error());
    }

    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    }
    .into())
}

/// Parse a newline-delimited JSON body into events.
///
/// A malformed or oversized line, or a broken connection, ends the stream;
/// the consumer sees a stream without a final event.
fn ndjson_events(response: Response) -> EventStream {
    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .boxed();
    let lines = FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(MAX_EVENT_LINE),
    );

    lines
        .filter_map(|line| {
            future::ready(match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(
                    serde_json::from_str::<TaskEvent>(&line)
                        .map_err(|e| warn!(error = %e, "Malformed event line, closing stream"))
                        .ok(),
                ),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(limit = MAX_EVENT_LINE, "Event line too long, closing stream");
                    Some(None)
                }
                Err(LinesCodecError::Io(e)) => {
                    warn!(error = %e, "Event stream interrupted");
                    Some(None)
                }
            })
        })
        .take_while(|event| future::ready(event.is_some()))
        .filter_map(future::ready)
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ContextId;
    use crate::protocol::{TaskState, TaskStatus, TaskStatusUpdateEvent};

    fn status(seq: u64, state: TaskState) -> String {
        serde_json::to_string(&TaskEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: TaskId::new(),
            context_id: ContextId::new(),
            seq,
            status: TaskStatus::new(state, None),
            is_final: state.is_final(),
        }))
        .unwrap()
    }

    fn response(body: String) -> Response {
        Response::from(axum::http::Response::new(body))
    }

    #[tokio::test]
    async fn test_lines_parsed_in_order() {
        // CRLF, a blank keep-alive line, and a last line without newline.
        let body = format!(
            "{}\r\n\n{}\n{}",
            status(1, TaskState::Submitted),
            status(2, TaskState::Working),
            status(3, TaskState::Completed)
        );
        let events: Vec<TaskEvent> = ndjson_events(response(body)).collect().await;
        let seqs: Vec<u64> = events.iter().map(TaskEvent::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[2].state(), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn test_malformed_line_ends_stream() {
        let body = format!(
            "{}\nnot json\n{}\n",
            status(1, TaskState::Working),
            status(2, TaskState::Completed)
        );
        let events: Vec<TaskEvent> = ndjson_events(response(body)).collect().await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_line_ends_stream() {
        let body = format!(
            "{}\n{}\n{}\n",
            status(1, TaskState::Working),
            "x".repeat(MAX_EVENT_LINE + 1),
            status(2, TaskState::Completed)
        );
        let events: Vec<TaskEvent> = ndjson_events(response(body)).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq(), 1);
    }
}
