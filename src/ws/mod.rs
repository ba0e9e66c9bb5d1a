pub mod dispatch;
pub mod handler;
pub mod outbound;
pub mod socket;

pub use outbound::{DEFAULT_OUTBOUND_DEPTH, OutboundFrame, OutboundQueue, PushOutcome};

use crate::AppState;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// WebSocket close codes used at the boundary.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// A socket this replica is servicing. The socket task owns the socket
/// itself; everything else reaches it through the outbound queue.
#[derive(Clone)]
pub struct LocalSocket {
    pub socket_id: String,
    pub session_id: String,
    pub user_id: String,
    pub connected_at: i64,
    pub queue: Arc<OutboundQueue>,
}

/// Per-replica registry of live sockets, indexed by socket id. Two sockets
/// for the same session are legal; each cleans up independently.
#[derive(Clone, Default)]
pub struct WsManager {
    sockets: Arc<RwLock<HashMap<String, LocalSocket>>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, socket: LocalSocket) {
        self.sockets
            .write()
            .await
            .insert(socket.socket_id.clone(), socket);
    }

    pub async fn unregister(&self, socket_id: &str) {
        self.sockets.write().await.remove(socket_id);
    }

    pub async fn count(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<LocalSocket> {
        self.sockets.read().await.values().cloned().collect()
    }

    /// First phase of shutdown: tell every local socket to flush and close.
    pub async fn broadcast_shutdown(&self) {
        let payload = json!({"type": "server_shutdown"}).to_string();
        for socket in self.sockets.read().await.values() {
            socket.queue.push(OutboundFrame::lifecycle(payload.clone()));
        }
    }
}

pub fn create_routes() -> axum::Router<Arc<AppState>> {
    use axum::routing::get;

    axum::Router::new().route("/ws/connect", get(handler::ws_connect))
}
