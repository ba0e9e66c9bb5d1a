use crate::AppState;
use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::session::{Connection, Session};
use crate::validation::ValidatedJson;
use crate::validation::rules::{validate_password_strength, validate_username_format};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use validator::Validate;

#[derive(Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(custom(function = "validate_username_format"))]
    pub username: String,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    #[validate(custom(function = "validate_password_strength"))]
    pub password: String,
}

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    pub username: String,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub chat_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateSessionRequest {
    pub chat_id: Option<String>,
    #[serde(default = "empty_patch")]
    pub data: Value,
}

fn empty_patch() -> Value {
    json!({})
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub user: crate::auth::UserView,
    pub session_id: String,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    ValidatedJson(payload): ValidatedJson<RegisterRequest>,
) -> AppResult<Json<Value>> {
    let user = state
        .users
        .register(&payload.username, &payload.email, &payload.password)
        .await?;

    Ok(Json(json!({
        "message": "User registered",
        "username": user.username,
    })))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ValidatedJson(payload): ValidatedJson<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let outcome = state.users.login(&payload.username, &payload.password).await?;

    Ok(Json(LoginResponse {
        access_token: outcome.token,
        token_type: "bearer".to_string(),
        expires_in: outcome.expires_in,
        user: outcome.user,
        session_id: outcome.session.session_id,
    }))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(payload): Json<CreateSessionRequest>,
) -> AppResult<Json<Value>> {
    if payload.user_id != principal.username {
        return Err(AppError::forbidden("Cannot create session for another user"));
    }

    let session = state
        .sessions
        .create(&payload.user_id, payload.chat_id.as_deref())
        .await?;

    Ok(Json(json!({
        "session_id": session.session_id,
        "user_id": session.user_id,
        "chat_id": session.chat_id,
        "data": session.data,
        "ws_url": ws_url_template(&state, &session.session_id),
    })))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> AppResult<Json<Session>> {
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| AppError::not_found("Session"))?;

    if session.user_id != principal.username && !principal.is_admin() {
        return Err(AppError::forbidden("Session access denied"));
    }

    Ok(Json(session))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(session_id): Path<String>,
    Json(payload): Json<UpdateSessionRequest>,
) -> AppResult<Json<Session>> {
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| AppError::not_found("Session"))?;

    if session.user_id != principal.username {
        return Err(AppError::forbidden("Session access denied"));
    }

    let updated = state
        .sessions
        .update(&session_id, &payload.data, payload.chat_id.as_deref())
        .await?;

    Ok(Json(updated))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> AppResult<Json<Value>> {
    let closed = state.users.logout(&principal, None).await?;

    Ok(Json(json!({
        "message": format!("Logged out; {} session(s) closed", closed),
    })))
}

pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> AppResult<Json<Value>> {
    state.users.delete_account(&principal.username).await?;

    Ok(Json(json!({
        "message": "Account deleted",
    })))
}

pub async fn user_sessions(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(username): Path<String>,
) -> AppResult<Json<Value>> {
    require_self_or_admin(&principal, &username)?;

    let sessions = state.sessions.for_user(&username).await?;
    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

pub async fn user_connection(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(username): Path<String>,
) -> AppResult<Json<Connection>> {
    require_self_or_admin(&principal, &username)?;

    // A user can hold several sessions; report the liveliest connection.
    let mut best: Option<Connection> = None;
    for session in state.sessions.for_user(&username).await? {
        if let Some(conn) = state.connections.lookup(&session.session_id).await? {
            let better = match &best {
                None => true,
                Some(current) => {
                    (conn.ws_connected, conn.last_seen) > (current.ws_connected, current.last_seen)
                }
            };
            if better {
                best = Some(conn);
            }
        }
    }

    best.map(Json).ok_or_else(|| AppError::not_found("Connection"))
}

fn require_self_or_admin(principal: &Principal, username: &str) -> AppResult<()> {
    if principal.username != username && !principal.is_admin() {
        return Err(AppError::forbidden("Access denied"));
    }
    Ok(())
}

fn ws_url_template(state: &AppState, session_id: &str) -> String {
    format!(
        "ws://{}/ws/connect?session_id={}&token={{access_token}}",
        state.config.server_address(),
        session_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_validation() {
        let ok = RegisterRequest {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password: "password123".to_string(),
        };
        assert!(ok.validate().is_ok());

        let bad_email = RegisterRequest {
            email: "not-an-email".to_string(),
            ..register_like("alice", "password123")
        };
        assert!(bad_email.validate().is_err());

        let bad_username = register_like("2bad", "password123");
        assert!(bad_username.validate().is_err());

        let weak_password = register_like("alice", "weak");
        assert!(weak_password.validate().is_err());
    }

    #[test]
    fn test_login_request_validation() {
        let ok = LoginRequest {
            username: "alice".to_string(),
            password: "x".to_string(),
        };
        assert!(ok.validate().is_ok());

        let empty = LoginRequest {
            username: "".to_string(),
            password: "x".to_string(),
        };
        assert!(empty.validate().is_err());
    }

    fn register_like(username: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: "alice@example.com".to_string(),
            password: password.to_string(),
        }
    }
}
