pub mod connection;
pub mod registry;

pub use connection::{Connection, ConnectionRegistry};
pub use registry::SessionRegistry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_CHAT_ID: &str = "default";

/// Per-user, per-chat state container. Owned by the store; replicas only
/// hold it transiently while serving a request or socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub data: serde_json::Value,
    pub created_at: i64,
    pub last_access: i64,
}

impl Session {
    pub fn new(user_id: &str, chat_id: Option<&str>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            chat_id: chat_id
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(DEFAULT_CHAT_ID)
                .to_string(),
            data: serde_json::json!({}),
            created_at: now,
            last_access: now,
        }
    }

    pub fn is_expired(&self, timeout_seconds: u64, now: i64) -> bool {
        now.saturating_sub(self.last_access) > timeout_seconds as i64
    }

    /// Hash-field layout persisted under `sessions:<sid>`.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("user_id".to_string(), self.user_id.clone()),
            ("chat_id".to_string(), self.chat_id.clone()),
            ("data".to_string(), self.data.to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("last_access".to_string(), self.last_access.to_string()),
        ]
    }

    pub fn from_fields(session_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let user_id = fields.get("user_id")?.clone();
        Some(Self {
            session_id: session_id.to_string(),
            user_id,
            chat_id: fields
                .get("chat_id")
                .cloned()
                .unwrap_or_else(|| DEFAULT_CHAT_ID.to_string()),
            data: fields
                .get("data")
                .and_then(|d| serde_json::from_str(d).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            created_at: fields
                .get("created_at")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_access: fields
                .get("last_access")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Deep-merge `patch` into `base`. Objects merge recursively; any other
/// value (including null) replaces the existing one, so the last writer
/// wins per conflicting field.
pub fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
