//! Request identity and logging.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::AppState;

/// Per-request identifier, available to handlers as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tag the request with a [`RequestId`] and log its arrival and completion.
///
/// Completion is when the response head is ready; streamed bodies log their
/// own end.
pub async fn request_logger(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = RequestId::new();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    tracing::info!(
        request = %request_id,
        method = %method,
        path = %path,
        remote = ?remote,
        "Incoming request"
    );
    state
        .tracer
        .record("request", "incoming", format_args!("{request_id} {method} {path}"));
    req.extensions_mut().insert(request_id.clone());

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    if status.is_server_error() {
        tracing::warn!(request = %request_id, status = status.as_u16(), duration_ms, "Request failed");
    } else {
        tracing::info!(request = %request_id, status = status.as_u16(), duration_ms, "Request completed");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }
}
