//! HTTP surface of an agent
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | POST | `/v1/message/send` | `SendMessageRequest` | `Task` at its final state |
//! | POST | `/v1/message/stream` | `SendMessageRequest` | NDJSON `TaskEvent`s |
//! | GET | `/v1/tasks/:id` | | `Task` |
//! | GET | `/v1/tasks/:id/subscribe` | | NDJSON `TaskEvent`s |
//! | POST | `/v1/tasks/:id/cancel` | | `Task` |
//! | GET | `/.well-known/agent.json` | | `AgentDescriptor` |

use crate::error::Error;
use crate::ids::TaskId;
use crate::protocol::{AgentDescriptor, ErrorBody, ErrorEnvelope, SendMessageRequest, Task};
use crate::stream::EventStream;
use crate::task::TaskManager;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const NDJSON: &str = "application/x-ndjson";

/// Error response: `{"error": {...}}` with a status derived from the kind.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownContext { .. } | Error::UnknownTask(_) => StatusCode::NOT_FOUND,
            Error::TaskClosed { .. } => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        warn!(status = status.as_u16(), error = %self.0, "Request rejected");
        let body = ErrorEnvelope {
            error: ErrorBody::from(&self.0),
        };
        (status, Json(body)).into_response()
    }
}

/// Router exposing `manager`
pub fn router(manager: Arc<TaskManager>) -> Router {
    Router::new()
        .route("/.well-known/agent.json", get(descriptor))
        .route("/v1/message/send", post(send_message))
        .route("/v1/message/stream", post(stream_message))
        .route("/v1/tasks/:id", get(get_task))
        .route("/v1/tasks/:id/subscribe", get(subscribe))
        .route("/v1/tasks/:id/cancel", post(cancel_task))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Serve `manager` on `listener` until the server fails.
pub async fn serve(listener: TcpListener, manager: Arc<TaskManager>) -> std::io::Result<()> {
    info!(
        agent = %manager.descriptor().id,
        addr = ?listener.local_addr().ok(),
        "Agent RPC server listening"
    );
    axum::serve(listener, router(manager)).await
}

async fn descriptor(State(manager): State<Arc<TaskManager>>) -> Json<AgentDescriptor> {
    Json(manager.descriptor().clone())
}

async fn send_message(
    State(manager): State<Arc<TaskManager>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(manager.send_message(request).await?))
}

async fn stream_message(
    State(manager): State<Arc<TaskManager>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let events = manager.send_message_streaming(request).await?;
    Ok(ndjson(events))
}

async fn get_task(
    State(manager): State<Arc<TaskManager>>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(manager.get_task(&task_id).await?))
}

async fn subscribe(
    State(manager): State<Arc<TaskManager>>,
    Path(task_id): Path<TaskId>,
) -> Result<Response, ApiError> {
    let events = manager.subscribe(&task_id).await?;
    Ok(ndjson(events))
}

async fn cancel_task(
    State(manager): State<Arc<TaskManager>>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(manager.cancel_task(&task_id).await?))
}

fn ndjson(events: EventStream) -> Response {
    let lines = events.map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            line
        })
    });
    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ContextId;
    use crate::protocol::{ErrorKind, Message, TaskEvent, TaskState};
    use crate::task::{AgentExecutor, ExecutionOutcome, ExecutorError, RequestContext, TaskUpdater};
    use async_trait::async_trait;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait]
    impl AgentExecutor for Echo {
        async fn execute(
            &self,
            ctx: RequestContext,
            _updater: TaskUpdater,
        ) -> std::result::Result<ExecutionOutcome, ExecutorError> {
            Ok(ExecutionOutcome::completed_text(ctx.message.text()))
        }
    }

    fn app() -> Router {
        let descriptor = AgentDescriptor::new("echo", "Echo", "http://echo.local");
        router(Arc::new(TaskManager::new(descriptor, Arc::new(Echo))))
    }

    fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_descriptor_document() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/.well-known/agent.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let descriptor: AgentDescriptor = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(descriptor.id, "echo");
    }

    #[tokio::test]
    async fn test_send_returns_final_task() {
        let request = SendMessageRequest {
            context_id: ContextId::new(),
            task_id: None,
            message: Message::caller_text("hello"),
        };
        let response = app()
            .oneshot(post_json("/v1/message/send", &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task: Task = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(task.status.state, TaskState::Completed);
        assert_eq!(task.context_id, request.context_id);
    }

    #[tokio::test]
    async fn test_stream_is_ndjson() {
        let request = SendMessageRequest {
            context_id: ContextId::new(),
            task_id: None,
            message: Message::caller_text("hello"),
        };
        let response = app()
            .oneshot(post_json("/v1/message/stream", &request))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], NDJSON);

        let body = String::from_utf8(body_bytes(response).await).unwrap();
        let events: Vec<TaskEvent> = body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert!(events.last().unwrap().is_final());
        assert_eq!(events.last().unwrap().state(), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn test_unknown_task_is_404_envelope() {
        let request = SendMessageRequest {
            context_id: ContextId::new(),
            task_id: Some(TaskId::new()),
            message: Message::caller_text("continue"),
        };
        let response = app()
            .oneshot(post_json("/v1/message/send", &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let envelope: ErrorEnvelope = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(envelope.error.kind, ErrorKind::UnknownContext);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_404() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/tasks/{}/cancel", TaskId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
