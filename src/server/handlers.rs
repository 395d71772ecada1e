//! Route handlers.
//!
//! The supervisor and provisioner are called one after the other, never
//! together, so a handler re-reads the record whenever it needs the other
//! side's view.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{info, warn};

use super::types::{
    CreateServerResponse, LoginRequest, LoginResponse, MessageResponse, ServerRequest,
    StatusResponse, TokenQuery,
};
use super::{AppError, SharedState, extract_token};
use crate::model::{NetworkBinding, ServerRecord};
use crate::provisioner::{NetworkIdentity, ProvisionerSummary};

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

fn binding(identity: &NetworkIdentity) -> NetworkBinding {
    NetworkBinding {
        interface: identity.name.clone(),
        ipv6_address: identity.ipv6_address.clone(),
    }
}

/// Whether any remaining server still listens on `port`.
fn port_in_use(state: &SharedState, port: u16) -> bool {
    state.supervisor.list_all().iter().any(|record| record.port == port)
}

// =============================================================================
// Servers
// =============================================================================

/// GET /servers
pub(crate) async fn list_servers(State(state): State<SharedState>) -> Json<Vec<ServerRecord>> {
    Json(state.supervisor.list_all())
}

/// POST /servers - create the record, then give it a network identity.
///
/// If the identity cannot be built the record is removed again.
pub(crate) async fn create_server(
    State(state): State<SharedState>,
    payload: Result<Json<ServerRequest>, JsonRejection>,
) -> Result<Json<CreateServerResponse>, AppError> {
    let req = body(payload)?;
    let port = req.port.as_text();
    let id = state.supervisor.create(&req.name, &port, &req.directory)?;

    if !state.vlan_enabled {
        info!(server = %id, name = %req.name, %port, "server created");
        return Ok(Json(CreateServerResponse {
            id,
            vlan_interface: None,
            ipv6_address: None,
        }));
    }

    let identity = match state.provisioner.allocate(&port).await {
        Ok(identity) => identity,
        Err(e) => {
            if let Err(cleanup) = state.supervisor.delete(&id).await {
                warn!(server = %id, error = %cleanup, "failed to discard server after provisioning error");
            }
            return Err(e.into());
        }
    };
    state.supervisor.attach_network(&id, Some(binding(&identity)))?;

    info!(server = %id, name = %req.name, %port, interface = %identity.name, "server created");
    Ok(Json(CreateServerResponse {
        id,
        vlan_interface: Some(identity.name),
        ipv6_address: Some(identity.ipv6_address),
    }))
}

/// PUT /servers/{id}
///
/// A port change moves the network identity. The update itself is never
/// undone; if the new identity cannot be built it is reported as 206 Partial
/// Content and the next start retries the allocation.
pub(crate) async fn update_server(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    payload: Result<Json<ServerRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    let previous = state
        .supervisor
        .update(&id, &req.name, &req.port.as_text(), &req.directory)
        .await?;

    let Some(current) = state.supervisor.get(&id) else {
        // Deleted concurrently; nothing left to re-home.
        return Ok(StatusCode::OK.into_response());
    };
    if !state.vlan_enabled || current.port == previous.port {
        return Ok(StatusCode::OK.into_response());
    }

    let allocated = match state.provisioner.allocate(&current.port.to_string()).await {
        Ok(identity) => state
            .supervisor
            .attach_network(&id, Some(binding(&identity)))
            .map(|()| identity)
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    if !port_in_use(&state, previous.port) {
        if let Err(e) = state.provisioner.release(&previous.port.to_string()).await {
            warn!(server = %id, port = previous.port, error = %e, "failed to release previous network identity");
        }
    }

    match allocated {
        Ok(identity) => {
            info!(server = %id, from = previous.port, to = current.port, interface = %identity.name, "server moved to new port");
            Ok(StatusCode::OK.into_response())
        }
        Err(e) => {
            warn!(server = %id, port = current.port, error = %e, "server updated but new interface could not be created");
            Ok((
                StatusCode::PARTIAL_CONTENT,
                Json(json!({
                    "error": format!("Server updated but failed to create VLAN interface: {e}")
                })),
            )
                .into_response())
        }
    }
}

/// DELETE /servers/{id}
///
/// A failed interface teardown does not undo the delete; it is reported
/// as 206 Partial Content.
pub(crate) async fn delete_server(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let removed = state.supervisor.delete(&id).await?;
    info!(server = %id, name = %removed.name, "server deleted");

    if port_in_use(&state, removed.port) {
        return Ok(StatusCode::OK.into_response());
    }

    match state.provisioner.release(&removed.port.to_string()).await {
        Ok(()) => Ok(StatusCode::OK.into_response()),
        Err(e) => {
            warn!(server = %id, port = removed.port, error = %e, "server deleted but interface removal failed");
            Ok((
                StatusCode::PARTIAL_CONTENT,
                Json(json!({
                    "error": format!("Server deleted but failed to remove VLAN interface: {e}")
                })),
            )
                .into_response())
        }
    }
}

/// POST /servers/{id}/start
///
/// With provisioning enabled, the identity is (re)built first so a server
/// loaded from disk after a restart gets its interface back.
pub(crate) async fn start_server(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let record = state
        .supervisor
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Server not found: {id}")))?;

    if state.vlan_enabled && !record.running {
        let identity = state.provisioner.allocate(&record.port.to_string()).await?;
        if record.network() != Some(binding(&identity)) {
            state.supervisor.attach_network(&id, Some(binding(&identity)))?;
        }
    }

    state.supervisor.start(&id).await?;
    Ok(StatusCode::OK)
}

/// POST /servers/{id}/stop
pub(crate) async fn stop_server(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let pid = state.supervisor.pid(&id);
    state.supervisor.stop(&id).await?;
    info!(server = %id, pid, "server stopped");
    Ok(StatusCode::OK)
}

/// GET /servers/{id}/status
pub(crate) async fn server_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    state
        .supervisor
        .status(&id)
        .map(|running| Json(StatusResponse { running }))
        .ok_or_else(|| AppError::NotFound(format!("Server not found: {id}")))
}

// =============================================================================
// Sessions
// =============================================================================

/// POST /auth/login
pub(crate) async fn login(
    State(state): State<SharedState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let req = body(payload)?;
    let session = state.sessions.login(&req.password).ok_or_else(|| {
        warn!("rejected login attempt");
        AppError::Unauthorized("Invalid password".into())
    })?;

    info!(
        expires_at = %session.expires_at,
        active = state.sessions.active_sessions(),
        "session opened"
    );
    Ok(Json(LoginResponse {
        token: session.token,
        expires_at: session.expires_at.to_rfc3339(),
    }))
}

/// POST /auth/logout
pub(crate) async fn logout(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<MessageResponse>, AppError> {
    let token = extract_token(&headers, Some(query))
        .ok_or_else(|| AppError::BadRequest("No token provided".into()))?;

    state.sessions.logout(&token);
    Ok(Json(MessageResponse {
        message: "Logged out successfully".into(),
    }))
}

// =============================================================================
// Network identities
// =============================================================================

/// GET /vlan/interfaces
pub(crate) async fn vlan_interfaces(State(state): State<SharedState>) -> Json<Vec<NetworkIdentity>> {
    Json(state.provisioner.identities().await)
}

/// GET /vlan/status
pub(crate) async fn vlan_status(State(state): State<SharedState>) -> Json<ProvisionerSummary> {
    Json(state.provisioner.summary().await)
}
