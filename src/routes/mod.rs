pub mod admin;
pub mod health;
pub mod sessions;

use crate::AppState;
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;

/// Routes that carry no bearer token.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/register", post(sessions::register))
        .route("/sessions/login", post(sessions::login))
        .route("/health", get(health::health))
        .route("/ws/health", get(health::ws_health))
}

/// Routes behind the bearer-token middleware; the caller layers it on.
pub fn protected_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/create", post(sessions::create))
        .route("/sessions/logout", post(sessions::logout))
        .route("/sessions/delete_account", post(sessions::delete_account))
        .route(
            "/sessions/users/:username/sessions",
            get(sessions::user_sessions),
        )
        .route(
            "/sessions/users/:username/connection",
            get(sessions::user_connection),
        )
        .route("/sessions/admin/all-sessions", get(admin::all_sessions))
        .route("/sessions/admin/users", get(admin::all_users))
        .route(
            "/sessions/admin/sessions/:session_id",
            delete(admin::delete_session),
        )
        .route("/sessions/admin/users/:username", delete(admin::delete_user))
        .route("/sessions/update/:session_id", post(sessions::update))
        .route("/sessions/:session_id", get(sessions::get_session))
}
