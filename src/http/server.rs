//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admit, limit_state, AdmissionState};
use crate::config::ServerConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::AdmissionEngine;

/// Build the application router.
///
/// `/ping` sits behind the admission middleware. `/ratelimit/state` is
/// read-only and not rate limited, so inspecting a blocked identity does
/// not extend its block.
pub fn router(state: AdmissionState) -> Router {
    let limited = Router::new()
        .route("/ping", get(ping))
        .route_layer(from_fn_with_state(state.clone(), admit));

    Router::new()
        .route("/ratelimit/state", get(limit_state))
        .merge(limited)
        .with_state(state)
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

/// HTTP server fronting the admission engine.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware and handler state
    state: AdmissionState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(config: &ServerConfig, engine: Arc<AdmissionEngine>) -> Result<Self> {
        Ok(Self {
            addr: config.http_addr,
            state: AdmissionState::new(engine, config)?,
        })
    }

    /// The address the server binds to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = router(self.state);

        info!(
            addr = %self.addr,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}
