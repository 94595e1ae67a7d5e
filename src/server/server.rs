//! Relay HTTP server with axum router and graceful shutdown.

use std::net::SocketAddr;

use axum::http::{header, HeaderValue};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use super::error::ServerError;
use super::handlers::{get_still, get_stream, not_found, AppState};
use super::middleware::request_logger;
use crate::config::{RelayConfig, ServerConfig};
use crate::session::SessionManager;
use crate::snapshot::SnapshotController;

/// HTTP server exposing `/stream` and `/still`.
pub struct RelayServer {
    /// Listener configuration.
    config: ServerConfig,
    /// Application state shared across handlers.
    state: AppState,
    /// Triggers graceful shutdown.
    cancel: CancellationToken,
}

impl RelayServer {
    /// Build the server and its components from configuration.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        let tracer = config.tracer();
        let state = AppState {
            session: SessionManager::new(config.session_config(), tracer),
            snapshots: SnapshotController::new(config.snapshot_config(), tracer),
            stream_content_type: config.capture.stream_content_type.clone(),
            snapshot_content_type: config.capture.snapshot_content_type.clone(),
            tracer,
        };

        Self {
            config: config.server.clone(),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an external token to trigger shutdown (builder pattern).
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the configured address as a string.
    #[must_use]
    pub fn address(&self) -> String {
        self.config.address()
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let routes = Router::new()
            .route("/stream", get(get_stream))
            .route("/still", get(get_still))
            .fallback(not_found);

        with_layers(routes, self.state.clone())
    }

    /// Run the server, binding to the configured address.
    ///
    /// Runs until Ctrl+C, SIGTERM or the cancellation token, then shuts down
    /// gracefully and stops any running stream capture.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::BindError {
                address: addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if serving fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let app = self.build_router();
        let cancel = self.cancel.clone();
        let session = self.state.session.clone();

        tracing::info!(address = ?listener.local_addr().ok(), "Camera relay service listening");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                () = wait_for_sigterm() => tracing::info!("Received SIGTERM"),
            }
            tracing::info!("Relay server shutting down gracefully");
        })
        .await
        .map_err(ServerError::Serve);

        session.shutdown().await;
        result
    }
}

/// Attach middleware and state to the routes.
fn with_layers(routes: Router<AppState>, state: AppState) -> Router {
    routes
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            request_logger,
        ))
        .layer(CatchPanicLayer::new())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONNECTION,
            HeaderValue::from_static("close"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
