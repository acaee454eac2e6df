//! Axum-based HTTP server for the gateway.

use axum::{
    extract::{DefaultBodyLimit, Json, MatchedPath, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use neural_bridge_core::config::ServerConfig;
use neural_bridge_core::{CommandEnvelope, Error, ErrorKind, ResponseEnvelope, Result};
use neural_bridge_governance::track_request;

use crate::dispatcher::{Command, CommandDispatcher};

/// Room for the envelope fields around the payload itself.
const ENVELOPE_OVERHEAD_BYTES: usize = 16 * 1024;

/// Shared application state.
pub struct AppState {
    pub dispatcher: Arc<CommandDispatcher>,
    bootstrap_digest: Option<[u8; 32]>,
}

/// Gateway server.
pub struct GatewayServer {
    config: ServerConfig,
    body_limit: usize,
    state: Arc<AppState>,
    metrics_handle: Option<PrometheusHandle>,
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

impl GatewayServer {
    pub fn new(config: ServerConfig, max_payload_bytes: usize, dispatcher: Arc<CommandDispatcher>) -> Self {
        let bootstrap_digest = config
            .bootstrap_token
            .as_ref()
            .map(|token: &Secret<String>| digest(token.expose_secret()));
        if bootstrap_digest.is_none() {
            tracing::warn!("No bootstrap token configured; POST /v1/sessions is disabled");
        }
        Self {
            config,
            body_limit: max_payload_bytes.saturating_add(ENVELOPE_OVERHEAD_BYTES),
            state: Arc::new(AppState {
                dispatcher,
                bootstrap_digest,
            }),
            metrics_handle: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the router.
    pub fn build_router(&self) -> Router {
        let mut app = Router::new()
            .route("/health", get(health_check))
            .route("/v1/command", post(handle_command))
            .route("/v1/sessions", post(create_session))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            app = app.route("/metrics", get(move || std::future::ready(handle.render())));
        }

        app = app
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.body_limit))
            .layer(middleware::from_fn(record_request))
            .layer(TraceLayer::new_for_http());

        let origins: Vec<HeaderValue> = self
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        if !origins.is_empty() {
            app = app.layer(
                CorsLayer::new()
                    .allow_origin(origins)
                    .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
            );
        }

        app
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;
        tracing::info!(addr = %addr, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        tracing::info!("Gateway stopped");
        Ok(())
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sandboxes": state.dispatcher.supervisor().active_count(),
        "active_sessions": state.dispatcher.gate().sessions().stats().active_sessions,
    }))
}

/// HTTP status for a response envelope. Execution failures are reported in
/// the body with 200; only gate and request errors change the status.
pub fn status_for(response: &ResponseEnvelope) -> StatusCode {
    match response.error_kind() {
        None => StatusCode::OK,
        Some(ErrorKind::SessionExpired) => StatusCode::UNAUTHORIZED,
        Some(ErrorKind::SecurityRejected) | Some(ErrorKind::PermissionDenied) => StatusCode::FORBIDDEN,
        Some(ErrorKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        Some(ErrorKind::InvalidPayload) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        Some(_) => StatusCode::OK,
    }
}

async fn handle_command(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<CommandEnvelope>,
) -> impl IntoResponse {
    let response = state.dispatcher.dispatch(envelope).await;
    (status_for(&response), Json(response))
}

#[derive(Debug, Default, Deserialize)]
struct SessionRequest {
    #[serde(default)]
    permissions: Option<Vec<String>>,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<SessionRequest>>,
) -> Response {
    let reject = |status: StatusCode, kind: ErrorKind, message: &str| {
        (status, Json(ResponseEnvelope::error(kind, message))).into_response()
    };

    let Some(expected) = state.bootstrap_digest else {
        return reject(
            StatusCode::NOT_FOUND,
            ErrorKind::NotFound,
            "session issuance is disabled",
        );
    };
    let presented = bearer(&headers).map(digest);
    if presented != Some(expected) {
        tracing::warn!("Session request with invalid bootstrap token");
        return reject(
            StatusCode::UNAUTHORIZED,
            ErrorKind::SecurityRejected,
            "invalid bootstrap token",
        );
    }

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let sessions = state.dispatcher.gate().sessions();
    let issued = match request.permissions {
        Some(permissions) => {
            if let Some(unknown) = permissions.iter().find(|p| Command::parse(p).is_none()) {
                return reject(
                    StatusCode::BAD_REQUEST,
                    ErrorKind::InvalidPayload,
                    &format!("unknown permission: {}", unknown),
                );
            }
            sessions.create_session(permissions).await
        }
        None => sessions.create_default_session().await,
    };

    (
        StatusCode::CREATED,
        Json(ResponseEnvelope::ok(json!({
            "session_token": issued.token.expose_secret(),
            "session": issued.session,
        }))),
    )
        .into_response()
}

async fn record_request(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(request).await;
    track_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ErrorKind::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (ErrorKind::SessionExpired, StatusCode::UNAUTHORIZED),
            (ErrorKind::PermissionDenied, StatusCode::FORBIDDEN),
            (ErrorKind::InvalidPayload, StatusCode::BAD_REQUEST),
            (ErrorKind::NotFound, StatusCode::NOT_FOUND),
            (ErrorKind::ToolExecutionFailed, StatusCode::OK),
            (ErrorKind::CoordinationUnavailable, StatusCode::OK),
        ];
        for (kind, status) in cases {
            assert_eq!(status_for(&ResponseEnvelope::error(kind, "x")), status, "{:?}", kind);
        }
        assert_eq!(status_for(&ResponseEnvelope::ok(json!({}))), StatusCode::OK);
    }

    #[test]
    fn test_bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);
    }
}
