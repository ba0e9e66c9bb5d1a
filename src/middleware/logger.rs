use crate::AppState;
use crate::error::ErrorEnvelope;
use axum::{
    Json,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Request logging plus error-envelope finishing. Error responses carry
/// their envelope in the extensions; this is the one place that knows the
/// request path, so it stamps it and rewrites the body.
pub async fn logger<B>(mut req: Request<B>, next: Next<B>) -> Response {
    let trace_id = Uuid::new_v4();
    req.extensions_mut().insert(trace_id);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(req).await;
    let status = response.status().as_u16();
    let elapsed = start.elapsed().as_millis();

    info!(trace_id = %trace_id, method = %method, path = %path, status = status, elapsed_ms = elapsed, "Request log");

    if let Some(mut envelope) = response.extensions_mut().remove::<ErrorEnvelope>() {
        envelope.path = path;
        let mut stamped = (response.status(), Json(envelope)).into_response();
        std::mem::swap(stamped.headers_mut(), response.headers_mut());
        // Content-Length of the original body no longer applies.
        stamped.headers_mut().remove(axum::http::header::CONTENT_LENGTH);
        stamped.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        );
        return stamped;
    }

    response
}

/// Per-request deadline. Store calls and handler work inherit it by being
/// cancelled when the outer future is dropped.
pub async fn request_deadline(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next<axum::body::Body>,
) -> Response {
    match tokio::time::timeout(state.config.request_timeout(), next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            let envelope = ErrorEnvelope::new(
                "request_timeout",
                "Request deadline exceeded".to_string(),
                StatusCode::SERVICE_UNAVAILABLE,
            );
            let mut response =
                (StatusCode::SERVICE_UNAVAILABLE, Json(envelope.clone())).into_response();
            response.extensions_mut().insert(envelope);
            response
        }
    }
}
