//! HTTP control API.
//!
//! Translates requests into supervisor and provisioner calls. The two are
//! never locked together; handlers call one, then the other, and tolerate
//! the other side having moved in between.
//!
//! ## Endpoints (all under `/api`)
//! - `POST /auth/login` - exchange the admin password for a bearer token
//! - `POST /auth/logout` - invalidate the presented token
//! - `GET /servers` - list servers
//! - `POST /servers` - create a server and its network identity
//! - `PUT /servers/{id}` - update a server (stops it if running)
//! - `DELETE /servers/{id}` - delete a server and release its identity
//! - `POST /servers/{id}/start` / `POST /servers/{id}/stop`
//! - `GET /servers/{id}/status`
//! - `GET /vlan/interfaces` / `GET /vlan/status`
//!
//! Every endpoint except login requires `Authorization: Bearer <token>` or
//! a `token` query parameter. `/` serves the web UI without authentication.

use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth::SessionStore;
use crate::error::{ProvisionError, SupervisorError};
use crate::provisioner::Provisioner;
use crate::supervisor::Supervisor;

mod handlers;
pub mod types;


use handlers::{
    create_server, delete_server, list_servers, login, logout, server_status, start_server,
    stop_server, update_server, vlan_interfaces, vlan_status,
};
use types::TokenQuery;

/// Shared state for HTTP handlers, built once in `main`.
pub struct AppState {
    pub supervisor: Supervisor,
    pub provisioner: Provisioner,
    pub sessions: SessionStore,
    /// When false, servers get no network identity and bind to the wildcard address.
    pub vlan_enabled: bool,
}

pub(crate) type SharedState = Arc<AppState>;

/// Built-in front end, served at `/` unless a static directory replaces it.
const INDEX_HTML: &str = include_str!("index.html");

pub fn router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let api = Router::new()
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/{id}", put(update_server).delete(delete_server))
        .route("/servers/{id}/start", post(start_server))
        .route("/servers/{id}/stop", post(stop_server))
        .route("/servers/{id}/status", get(server_status))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/vlan/interfaces", get(vlan_interfaces))
        .route("/vlan/status", get(vlan_status))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), require_session))
        .with_state(state);

    let app = Router::new().nest("/api", api);
    let app = match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app.route("/", get(|| async { Html(INDEX_HTML) })),
    };

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    )
    .layer(TraceLayer::new_for_http())
}

/// Bearer token from the `Authorization` header, else the `token` query parameter.
pub(crate) fn extract_token(headers: &HeaderMap, request_query: Option<TokenQuery>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| *scheme == "Bearer")
        .map(|(_, token)| token.to_string());

    bearer
        .or_else(|| request_query.and_then(|q| q.token))
        .filter(|token| !token.is_empty())
}

async fn require_session(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    if request.uri().path().ends_with("/auth/login") {
        return next.run(request).await;
    }

    let query = Query::<TokenQuery>::try_from_uri(request.uri()).ok().map(|q| q.0);
    match extract_token(request.headers(), query) {
        Some(token) if state.sessions.validate(&token) => next.run(request).await,
        _ => AppError::Unauthorized("Authentication required".into()).into_response(),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires; the other
/// one still can.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

// =============================================================================
// Error mapping
// =============================================================================

#[derive(Debug)]
pub(crate) enum AppError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<SupervisorError> for AppError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Invalid(e) => Self::BadRequest(e.to_string()),
            SupervisorError::NotFound(_) => Self::NotFound(err.to_string()),
            e if e.is_precondition() => Self::BadRequest(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl From<ProvisionError> for AppError {
    fn from(err: ProvisionError) -> Self {
        Self::Internal(format!("Failed to create VLAN interface: {err}"))
    }
}
