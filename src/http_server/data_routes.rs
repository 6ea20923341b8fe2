//! Data and Permission Routes
//!
//! Row mutations feed the change notifications every stream sees; role
//! assignment changes announce themselves on the permission channel.
//!
//! - `PUT /rows/:kind/:id` insert or replace a row
//! - `DELETE /rows/:kind/:id` delete a row
//! - `POST /permissions/:user_id/workspaces/:workspace_id` grant a workspace
//! - `DELETE /permissions/:user_id/workspaces/:workspace_id` revoke it

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{post, put},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::server::AppState;
use super::stream_routes::ErrorResponse;
use crate::realtime::{EntityKind, ScopeId};

#[derive(Debug, Serialize)]
pub struct PermissionChangeResponse {
    pub user_id: i32,
    pub workspace_id: ScopeId,
    pub changed: bool,
}

/// Create data and permission routes
pub fn data_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/rows/:kind/:id",
            put(upsert_row_handler).delete(delete_row_handler),
        )
        .route(
            "/permissions/:user_id/workspaces/:workspace_id",
            post(grant_handler).delete(revoke_handler),
        )
        .with_state(state)
}

fn parse_kind(kind: &str) -> Result<EntityKind, Response> {
    EntityKind::parse(kind).ok_or_else(|| {
        ErrorResponse::response(StatusCode::NOT_FOUND, format!("unknown entity type: {}", kind))
    })
}

async fn upsert_row_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
    Json(body): Json<Value>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    match state.db.upsert_json(kind, id, body) {
        Ok(row) => (StatusCode::OK, Json(row)).into_response(),
        Err(e) => ErrorResponse::response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn delete_row_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    match state.db.delete_json(kind, id) {
        Ok(Some(row)) => (StatusCode::OK, Json(row)).into_response(),
        Ok(None) => ErrorResponse::response(StatusCode::NOT_FOUND, format!("{} {} not found", kind, id)),
        Err(e) => ErrorResponse::response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn grant_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, workspace_id)): Path<(i32, ScopeId)>,
) -> Response {
    change_permission(&state, user_id, workspace_id, true)
}

async fn revoke_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, workspace_id)): Path<(i32, ScopeId)>,
) -> Response {
    change_permission(&state, user_id, workspace_id, false)
}

fn change_permission(state: &AppState, user_id: i32, workspace_id: ScopeId, grant: bool) -> Response {
    let Some(assignments) = state.authz.assignments() else {
        return ErrorResponse::response(
            StatusCode::CONFLICT,
            format!("authz mode {:?} has no role assignments", state.authz.mode()),
        );
    };
    if !state.users.values().any(|user| user.id == user_id) {
        return ErrorResponse::response(StatusCode::NOT_FOUND, format!("unknown user id: {}", user_id));
    }

    let changed = if grant {
        assignments.assign(user_id, workspace_id)
    } else {
        assignments.revoke(user_id, workspace_id)
    };
    if changed {
        info!(user_id, workspace_id, grant, "role assignment changed");
        state.db.notify_permissions_changed();
    }

    let body = PermissionChangeResponse {
        user_id,
        workspace_id,
        changed,
    };
    (StatusCode::OK, Json(body)).into_response()
}
