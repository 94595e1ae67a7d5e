//! HTTP handlers for the relay endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use tokio_util::sync::CancellationToken;

use super::error::RelayError;
use super::middleware::RequestId;
use crate::session::SessionManager;
use crate::snapshot::{SnapshotController, SnapshotOutcome};
use crate::trace::EventTracer;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Shared continuous-capture session.
    pub session: Arc<SessionManager>,
    /// Per-request still capture.
    pub snapshots: SnapshotController,
    /// Content type of `/stream` responses.
    pub stream_content_type: String,
    /// Content type of committed `/still` responses.
    pub snapshot_content_type: String,
    /// Optional event tracing shared with the components.
    pub tracer: EventTracer,
}

/// GET /stream - Join the shared live stream.
///
/// The response body is the subscription itself; when the client goes away
/// the body is dropped and the subscriber leaves the session.
pub async fn get_stream(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Response, RelayError> {
    let subscription = state.session.subscribe().await?;
    tracing::debug!(
        request = %request_id,
        session = subscription.session_id(),
        "Streaming to subscriber"
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, state.stream_content_type.clone())],
        Body::from_stream(subscription),
    )
        .into_response())
}

/// GET /still - Take one picture.
pub async fn get_still(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Response, RelayError> {
    // Armed before anything can produce a response: if this future is
    // dropped because the connection closed, the capture sees a cancellation.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let outcome = state.snapshots.capture(&request_id.0, cancel).await;
    let _ = guard.disarm();

    let response = match outcome? {
        SnapshotOutcome::Committed(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.snapshot_content_type.clone())],
            Body::from_stream(body),
        )
            .into_response(),
        SnapshotOutcome::Cancelled => (
            StatusCode::NO_CONTENT,
            [(header::CONTENT_TYPE, "text/plain")],
        )
            .into_response(),
        SnapshotOutcome::Failed { diagnostic } => (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "text/plain")],
            diagnostic,
        )
            .into_response(),
    };
    Ok(response)
}

/// Anything else.
pub async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
