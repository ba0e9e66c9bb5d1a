use crate::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = match state.store.ping().await {
        Ok(()) => "up",
        Err(_) => "down",
    };

    Json(json!({
        "status": if store == "up" { "ok" } else { "degraded" },
        "gateway_id": state.gateway_id,
        "store": store,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn ws_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "gateway_id": state.gateway_id,
        "active_connections": state.ws_manager.count().await,
        "pending_writes": state.batcher.pending_len(),
    }))
}
