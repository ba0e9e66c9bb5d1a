use crate::AppState;
use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use std::sync::Arc;

fn require_admin(principal: &Principal) -> AppResult<()> {
    if !principal.is_admin() {
        return Err(AppError::forbidden("Admin role required"));
    }
    Ok(())
}

pub async fn all_sessions(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> AppResult<Json<Value>> {
    require_admin(&principal)?;

    let sessions = state.sessions.all().await?;
    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

pub async fn all_users(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> AppResult<Json<Value>> {
    require_admin(&principal)?;

    let users = state.users.all().await?;
    Ok(Json(json!({
        "count": users.len(),
        "users": users,
    })))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&principal)?;

    state.sessions.delete(&session_id).await?;
    Ok(Json(json!({
        "message": format!("Session {} deleted", session_id),
    })))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(username): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&principal)?;

    state.users.delete_account(&username).await?;
    Ok(Json(json!({
        "message": format!("User {} deleted", username),
    })))
}
