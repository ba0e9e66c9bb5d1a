//! Inbound frame dispatch: tagged JSON decode, a static role table, and the
//! per-type handlers. Malformed or disallowed frames answer with an error
//! frame and leave the socket open.

use crate::AppState;
use crate::auth::{Principal, Role};
use crate::store::keys;
use crate::ws::outbound::{OutboundFrame, OutboundQueue};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

const USER_AND_ADMIN: &[Role] = &[Role::User, Role::Admin];
const ADMIN_ONLY: &[Role] = &[Role::Admin];

/// Static `type -> allowed roles` table. None means the type is unknown.
pub fn allowed_roles(message_type: &str) -> Option<&'static [Role]> {
    match message_type {
        "ping" | "pong" | "update_api_key" | "chat_message" => Some(USER_AND_ADMIN),
        "admin_command" => Some(ADMIN_ONLY),
        _ => None,
    }
}

/// Everything a handler needs to act on behalf of one socket.
pub struct SocketContext {
    pub state: Arc<AppState>,
    pub socket_id: String,
    pub session_id: String,
    pub principal: Principal,
    pub queue: Arc<OutboundQueue>,
}

impl SocketContext {
    pub fn reply(&self, frame: Value) {
        self.queue.push(OutboundFrame::normal(frame.to_string()));
    }

    pub fn reply_error(&self, message: &str) {
        self.reply(json!({"type": "error", "message": message}));
    }
}

/// Handle one inbound text frame. Never tears the socket down; lifecycle
/// transitions only come from timers, close frames, and bus events.
pub async fn handle_frame(ctx: &SocketContext, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            ctx.reply_error("invalid JSON");
            return;
        }
    };

    let Some(message_type) = frame.get("type").and_then(Value::as_str) else {
        ctx.reply_error("unsupported message type");
        return;
    };

    let Some(roles) = allowed_roles(message_type) else {
        debug!(message_type, "Unknown message type");
        ctx.reply_error("unsupported message type");
        return;
    };

    if !roles.contains(&ctx.principal.role) {
        debug!(
            message_type,
            user = %ctx.principal.username,
            "Role-gated message rejected"
        );
        ctx.reply_error("not permitted");
        return;
    }

    match message_type {
        "ping" => handle_ping(ctx, &frame).await,
        "pong" => handle_pong(ctx).await,
        "update_api_key" => handle_update_api_key(ctx, &frame).await,
        "chat_message" => handle_chat_message(ctx, &frame).await,
        "admin_command" => handle_admin_command(ctx, &frame).await,
        _ => unreachable!("type already matched against the role table"),
    }
}

async fn handle_ping(ctx: &SocketContext, frame: &Value) {
    let ts = frame.get("ts").cloned().unwrap_or(Value::Null);
    ctx.reply(json!({"type": "pong", "ts": ts}));

    if let Err(e) = ctx.state.connections.heartbeat(&ctx.session_id).await {
        warn!(session_id = %ctx.session_id, error = %e, "Heartbeat write failed");
    }
}

async fn handle_pong(ctx: &SocketContext) {
    // The pong deadline itself is reset by the socket loop on any inbound
    // frame; here we only refresh the connection record.
    if let Err(e) = ctx.state.connections.heartbeat(&ctx.session_id).await {
        warn!(session_id = %ctx.session_id, error = %e, "Heartbeat write failed");
    }
}

async fn handle_update_api_key(ctx: &SocketContext, frame: &Value) {
    let Some(key) = frame.get("key").and_then(Value::as_str) else {
        ctx.reply_error("missing key");
        return;
    };

    match ctx
        .state
        .sessions
        .update(&ctx.session_id, &json!({"api_key": key}), None)
        .await
    {
        Ok(_) => ctx.reply(json!({
            "type": "ack",
            "api_key": key,
            "session_id": ctx.session_id,
        })),
        Err(e) => {
            warn!(session_id = %ctx.session_id, error = %e, "Session update failed");
            ctx.reply_error("failed to update session");
        }
    }
}

async fn handle_chat_message(ctx: &SocketContext, frame: &Value) {
    if let Err(e) = ctx.state.sessions.touch(&ctx.session_id).await {
        warn!(session_id = %ctx.session_id, error = %e, "Session touch failed");
    }

    // Messages marked for broadcast are republished on the session topic so
    // every socket attached to this session (on any replica) sees them.
    if frame.get("broadcast").and_then(Value::as_bool) == Some(true) {
        let event = json!({
            "type": "chat_message",
            "session_id": ctx.session_id,
            "from": ctx.principal.username,
            "content": frame.get("content").cloned().unwrap_or(Value::Null),
            "origin": ctx.state.gateway_id,
        });
        ctx.state
            .bus
            .publish(&keys::session_topic(&ctx.session_id), &event)
            .await;
    }
}

async fn handle_admin_command(ctx: &SocketContext, frame: &Value) {
    let Some(command) = frame.get("command").and_then(Value::as_str) else {
        ctx.reply_error("missing command");
        return;
    };

    match command {
        "stats" => {
            let active = ctx.state.ws_manager.count().await;
            ctx.reply(json!({
                "type": "ack",
                "command": "stats",
                "active_connections": active,
                "gateway_id": ctx.state.gateway_id,
            }));
        }
        "list_connections" => {
            let sockets = ctx.state.ws_manager.snapshot().await;
            let connections: Vec<Value> = sockets
                .iter()
                .map(|s| {
                    json!({
                        "session_id": s.session_id,
                        "user_id": s.user_id,
                        "connected_at": s.connected_at,
                    })
                })
                .collect();
            ctx.reply(json!({
                "type": "ack",
                "command": "list_connections",
                "connections": connections,
            }));
        }
        "disconnect_session" => {
            let Some(target) = frame.get("session_id").and_then(Value::as_str) else {
                ctx.reply_error("missing session_id");
                return;
            };
            // Deleting the session publishes session_closed, which drains
            // the owning socket wherever it lives.
            match ctx.state.sessions.delete(target).await {
                Ok(()) => ctx.reply(json!({
                    "type": "ack",
                    "command": "disconnect_session",
                    "session_id": target,
                })),
                Err(e) => {
                    debug!(session_id = %target, error = %e, "Admin disconnect failed");
                    ctx.reply_error("session not found");
                }
            }
        }
        "promote" | "demote" => {
            let Some(target) = frame.get("username").and_then(Value::as_str) else {
                ctx.reply_error("missing username");
                return;
            };
            let role = if command == "promote" {
                Role::Admin
            } else {
                Role::User
            };
            match ctx.state.users.set_role(target, role).await {
                Ok(user) => ctx.reply(json!({
                    "type": "ack",
                    "command": command,
                    "username": user.username,
                    "role": user.role,
                })),
                Err(e) => {
                    debug!(username = %target, error = %e, "Role change failed");
                    ctx.reply_error("user not found");
                }
            }
        }
        _ => ctx.reply_error("unknown admin command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_table_user_types() {
        for message_type in ["ping", "pong", "update_api_key", "chat_message"] {
            let roles = allowed_roles(message_type).unwrap();
            assert!(roles.contains(&Role::User));
            assert!(roles.contains(&Role::Admin));
        }
    }

    #[test]
    fn test_role_table_admin_only() {
        let roles = allowed_roles("admin_command").unwrap();
        assert!(!roles.contains(&Role::User));
        assert!(roles.contains(&Role::Admin));
    }

    #[test]
    fn test_role_table_unknown_type() {
        assert!(allowed_roles("shutdown").is_none());
        assert!(allowed_roles("").is_none());
    }
}
