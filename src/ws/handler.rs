use crate::AppState;
use crate::auth::Principal;
use crate::error::AppResult;
use crate::session::Session;
use crate::store::keys;
use crate::ws::dispatch::SocketContext;
use crate::ws::outbound::{DEFAULT_OUTBOUND_DEPTH, OutboundFrame, OutboundQueue};
use crate::ws::{LocalSocket, close_code, socket};
use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub session_id: Option<String>,
    pub token: Option<String>,
}

pub async fn ws_connect(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, query, state))
}

async fn handle_connection(socket: WebSocket, query: ConnectQuery, state: Arc<AppState>) {
    match handshake(&state, &query).await {
        Ok((session, principal, token_exp)) => {
            run_session(socket, state, session, principal, token_exp).await;
        }
        Err(reason) => {
            info!(reason, "WebSocket handshake rejected");
            reject(socket, reason).await;
        }
    }
}

/// Validate the connection parameters: a live token, a known session, and
/// ownership of that session by the token's subject.
async fn handshake(
    state: &AppState,
    query: &ConnectQuery,
) -> Result<(Session, Principal, u64), &'static str> {
    let Some(token) = query.token.as_deref() else {
        return Err("missing token");
    };
    let Some(session_id) = query.session_id.as_deref() else {
        return Err("missing session_id");
    };

    let claims = state.tokens.verify(token).map_err(|_| "invalid token")?;

    let session = state
        .sessions
        .get(session_id)
        .await
        .map_err(|_| "store unavailable")?
        .ok_or("unknown session")?;

    if session.user_id != claims.sub {
        return Err("session not owned by token subject");
    }

    let principal = Principal {
        username: claims.sub,
        role: claims.role,
    };
    Ok((session, principal, claims.exp))
}

/// Any handshake failure closes with 1008 Policy Violation.
async fn reject(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

/// Register the connection, wire the topic subscriptions, run the socket
/// state machine, and clean up exactly once on the way out.
async fn run_session(
    socket: WebSocket,
    state: Arc<AppState>,
    session: Session,
    principal: Principal,
    token_exp: u64,
) {
    let socket_id = uuid::Uuid::new_v4().to_string();
    let session_id = session.session_id.clone();
    let queue = Arc::new(OutboundQueue::new(DEFAULT_OUTBOUND_DEPTH));

    if let Err(e) = register_connection(&state, &session_id).await {
        warn!(session_id = %session_id, error = %e, "Connection registration failed");
        reject(socket, "store unavailable").await;
        return;
    }

    let user_sub = state
        .bus
        .subscribe_local(&keys::user_topic(&principal.username), queue.clone())
        .await;
    let session_sub = state
        .bus
        .subscribe_local(&keys::session_topic(&session_id), queue.clone())
        .await;

    state
        .ws_manager
        .register(LocalSocket {
            socket_id: socket_id.clone(),
            session_id: session_id.clone(),
            user_id: principal.username.clone(),
            connected_at: chrono::Utc::now().timestamp(),
            queue: queue.clone(),
        })
        .await;

    queue.push(OutboundFrame::normal(
        json!({
            "type": "connected",
            "user_id": principal.username,
            "session_id": session_id,
            "gateway_id": state.gateway_id,
            "ping_interval": state.config.ping_interval_seconds,
            "inactivity_timeout": state.config.inactivity_timeout_seconds,
        })
        .to_string(),
    ));

    info!(
        session_id = %session_id,
        user = %principal.username,
        socket_id = %socket_id,
        "WebSocket connected"
    );

    let ctx = SocketContext {
        state: state.clone(),
        socket_id: socket_id.clone(),
        session_id: session_id.clone(),
        principal,
        queue: queue.clone(),
    };

    socket::run(&ctx, socket, token_exp).await;

    // Cleanup runs once per socket: the state machine has a single exit.
    state.bus.unsubscribe_local(user_sub).await;
    state.bus.unsubscribe_local(session_sub).await;
    queue.close();
    state.ws_manager.unregister(&socket_id).await;

    if let Err(e) = state.connections.mark_connected(&session_id, false).await {
        warn!(session_id = %session_id, error = %e, "Failed to clear connection flag");
    }
    state
        .bus
        .publish(
            &keys::session_topic(&session_id),
            &json!({
                "type": "disconnected",
                "session_id": session_id,
                "origin": state.gateway_id,
            }),
        )
        .await;

    info!(session_id = %session_id, socket_id = %socket_id, "WebSocket closed");
}

async fn register_connection(state: &AppState, session_id: &str) -> AppResult<()> {
    state.connections.register(session_id).await?;
    state.connections.mark_connected(session_id, true).await
}
