//! Server error types and their HTTP mapping.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::ConfigError;
use crate::session::SessionError;
use crate::snapshot::SnapshotError;

/// Failures surfaced to a single request.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    /// The shared stream could not be started.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A snapshot could not be taken.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl RelayError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Session(SessionError::CaptureUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Request failed");
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Errors that stop the server itself.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failed to bind to address.
    #[error("Failed to bind to {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Serving failed after binding.
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}
