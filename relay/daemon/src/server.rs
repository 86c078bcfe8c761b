//! HTTP Server
//!
//! Builds the axum router and runs it until shutdown is requested.
//!
//! ```text
//!   browser ──HTTP──► Router (TraceLayer) ──► handlers ──► ChatService
//!                                                             │
//!                                                  store ◄────┴────► Relay ──► engine
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use relay_core::ChatService;

use crate::handlers;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// Chat flow over the store and relay
    pub chat: Arc<ChatService>,
}

/// Build the application router
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/stream", get(handlers::stream_lines))
        .route("/new-discussion", post(handlers::new_discussion))
        .route("/new_discussion", get(handlers::new_discussion))
        .route("/reset-engine", post(handlers::reset_engine))
        .route("/stop", post(handlers::stop))
        .route("/export", get(handlers::export))
        .route(
            "/discussions",
            get(handlers::list_discussions).delete(handlers::delete_all_discussions),
        )
        .route("/discussions/{id}", delete(handlers::delete_discussion))
        .route(
            "/discussions/{id}/messages",
            get(handlers::discussion_messages),
        )
        .route("/bot", post(handlers::bot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `host:port` and serve `app` until `shutdown` resolves
pub async fn serve(
    host: &str,
    port: u16,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to listen on {host}:{port}"))?;
    let addr: SocketAddr = listener.local_addr().context("Failed to read bound address")?;
    info!(%addr, "Listening for HTTP requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}
