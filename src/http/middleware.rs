//! Admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::config::ServerConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{AdmissionEngine, Identity};

/// Body of every 429 response.
pub const DENIAL_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body of every 500 response caused by the store.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Address used when neither the socket nor a trusted header names the client.
const UNKNOWN_CLIENT: &str = "unknown";

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error message
    pub error: String,
}

impl ErrorBody {
    fn response(status: StatusCode, message: &str) -> Response {
        (
            status,
            Json(ErrorBody {
                error: message.to_string(),
            }),
        )
            .into_response()
    }
}

/// Shared state of the admission middleware and diagnostics handlers.
#[derive(Clone)]
pub struct AdmissionState {
    engine: Arc<AdmissionEngine>,
    trust_proxy: bool,
    token_header: HeaderName,
}

impl AdmissionState {
    /// Create the state from the server settings.
    pub fn new(engine: Arc<AdmissionEngine>, config: &ServerConfig) -> Result<Self> {
        let token_header = HeaderName::from_bytes(config.token_header.as_bytes()).map_err(|e| {
            TollgateError::Config(format!(
                "invalid token header `{}`: {}",
                config.token_header, e
            ))
        })?;

        Ok(Self {
            engine,
            trust_proxy: config.trust_proxy,
            token_header,
        })
    }

    /// Resolve the identity of a request from its peer address, proxy
    /// headers (when trusted) and token header.
    pub fn identity(&self, request: &Request) -> Identity {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let forwarded = if self.trust_proxy {
            forwarded_client(request.headers())
        } else {
            None
        };

        let ip = forwarded
            .or(peer)
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

        let token = request
            .headers()
            .get(&self.token_header)
            .and_then(|value| value.to_str().ok());

        Identity::new(ip, token)
    }
}

/// Client address announced by a proxy: the first `X-Forwarded-For` hop,
/// then `X-Real-IP`.
fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let first_hop = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    first_hop.or_else(real_ip).map(str::to_string)
}

/// Admit or reject a request before it reaches the inner service.
///
/// Allowed requests pass through; denials become 429 with
/// [`DENIAL_MESSAGE`]; store failures become 500 and never reveal their
/// cause to the client.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn admit(State(state): State<AdmissionState>, request: Request, next: Next) -> Response {
    let identity = state.identity(&request);

    match state.engine.decide(&identity).await {
        Ok(decision) if decision.is_allowed() => next.run(request).await,
        Ok(decision) => {
            debug!(ip = %identity.ip, decision = ?decision, "Request rejected");
            ErrorBody::response(StatusCode::TOO_MANY_REQUESTS, DENIAL_MESSAGE)
        }
        Err(e) => {
            error!(ip = %identity.ip, error = %e, "Admission decision failed");
            ErrorBody::response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
        }
    }
}

/// Report the caller's own counter and block marker.
pub async fn limit_state(State(state): State<AdmissionState>, request: Request) -> Response {
    let identity = state.identity(&request);

    match state.engine.snapshot(&identity).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            error!(ip = %identity.ip, error = %e, "Rate limit snapshot failed");
            ErrorBody::response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
        }
    }
}
