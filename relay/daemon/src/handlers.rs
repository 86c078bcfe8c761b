//! HTTP request handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::IntervalStream;
use tracing::{error, info, warn};

use relay_core::{
    ChatError, Discussion, DiscussionId, ExportedDiscussion, Message, RelayError, StoreError,
};

use crate::server::AppState;

const CHAT_PAGE: &str = include_str!("../static/chat.html");
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Response header carrying the discussion a `/bot` exchange was recorded under
pub const DISCUSSION_HEADER: &str = "x-discussion-id";

const DIAGNOSTIC_LINES: usize = 10;
const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Errors
// ============================================================================

/// Error rendered as a plain-text HTTP response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::Store(StoreError::DiscussionNotFound(_)) => StatusCode::NOT_FOUND,
            ChatError::Relay(RelayError::EngineSubmit(_) | RelayError::EngineUnavailable) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChatError::Relay(RelayError::Preempted) => StatusCode::CONFLICT,
            ChatError::Store(_) | ChatError::Relay(RelayError::EngineStart(_)) | ChatError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Request failed");
        } else {
            warn!(status = %self.status, error = %self.message, "Request rejected");
        }
        (
            self.status,
            [(header::CONTENT_TYPE, TEXT_PLAIN)],
            self.message,
        )
            .into_response()
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// `POST /bot` body
#[derive(Debug, Deserialize)]
pub struct BotRequest {
    /// User message
    pub message: String,
}

/// Optional title for a new discussion
#[derive(Debug, Default, Deserialize)]
pub struct NewDiscussionQuery {
    /// Discussion title
    pub title: Option<String>,
}

/// A created discussion
#[derive(Debug, Serialize, Deserialize)]
pub struct DiscussionCreated {
    /// Discussion id
    pub id: DiscussionId,
}

/// Result of an engine reset
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    /// Always `"reset"`
    pub status: String,
}

/// Result of a stop request
#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    /// Whether a response was running
    pub stopped: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /
pub async fn index() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

/// GET /stream
///
/// Emits ten numbered lines a second apart; checks that chunked responses
/// reach the browser unbuffered.
pub async fn stream_lines() -> Response {
    let ticks = IntervalStream::new(tokio::time::interval(DIAGNOSTIC_INTERVAL));
    let lines = ticks
        .take(DIAGNOSTIC_LINES)
        .enumerate()
        .map(|(i, _)| Ok::<_, Infallible>(format!("This is line {}\n", i + 1)));

    ([(header::CONTENT_TYPE, TEXT_PLAIN)], Body::from_stream(lines)).into_response()
}

/// POST /new-discussion, GET /new_discussion
pub async fn new_discussion(
    State(state): State<AppState>,
    Query(query): Query<NewDiscussionQuery>,
) -> Result<Json<DiscussionCreated>, ApiError> {
    let id = state.chat.new_discussion(query.title).await?;
    Ok(Json(DiscussionCreated { id }))
}

/// POST /reset-engine
pub async fn reset_engine(State(state): State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    state.chat.reset_engine().await?;
    info!("Engine reset on request");
    Ok(Json(ResetResponse {
        status: "reset".to_string(),
    }))
}

/// POST /stop
pub async fn stop(State(state): State<AppState>) -> Json<StopResponse> {
    Json(StopResponse {
        stopped: state.chat.stop(),
    })
}

/// GET /export
pub async fn export(
    State(state): State<AppState>,
) -> Result<Json<Vec<ExportedDiscussion>>, ApiError> {
    Ok(Json(state.chat.export().await?))
}

/// GET /discussions
pub async fn list_discussions(
    State(state): State<AppState>,
) -> Result<Json<Vec<Discussion>>, ApiError> {
    Ok(Json(state.chat.discussions().await?))
}

/// GET /discussions/{id}/messages
pub async fn discussion_messages(
    State(state): State<AppState>,
    Path(id): Path<DiscussionId>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(state.chat.messages(id).await?))
}

/// DELETE /discussions/{id}
pub async fn delete_discussion(
    State(state): State<AppState>,
    Path(id): Path<DiscussionId>,
) -> Result<StatusCode, ApiError> {
    if state.chat.delete_discussion(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("discussion {id} does not exist")))
    }
}

/// DELETE /discussions
pub async fn delete_all_discussions(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.chat.delete_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /bot
///
/// Streams the answer as it is generated, one character per chunk.
pub async fn bot(
    State(state): State<AppState>,
    Json(request): Json<BotRequest>,
) -> Result<Response, ApiError> {
    let reply = state.chat.send_message(&request.message).await?;
    let chunks = reply
        .stream
        .map(|c| Ok::<_, Infallible>(c.to_string()));

    let mut response = Body::from_stream(chunks).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    headers.insert(DISCUSSION_HEADER, HeaderValue::from(reply.discussion_id));
    Ok(response)
}
