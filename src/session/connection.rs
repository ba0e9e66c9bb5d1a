use crate::error::AppResult;
use crate::store::{StoreGateway, WriteBehindBatcher, WriteOp, keys};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Store-side pointer to the replica currently (or last) hosting a
/// session's socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub session_id: String,
    pub gateway_id: String,
    pub ws_connected: bool,
    pub last_seen: i64,
}

impl Connection {
    pub fn from_fields(session_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let gateway_id = fields.get("gateway_id")?.clone();
        Some(Self {
            session_id: session_id.to_string(),
            gateway_id,
            ws_connected: fields.get("ws_connected").map(String::as_str) == Some("true"),
            last_seen: fields
                .get("last_seen")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Tracks which replica owns the live socket for each session. Connect and
/// disconnect write through immediately; heartbeats ride the batcher.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: StoreGateway,
    batcher: WriteBehindBatcher,
    gateway_id: String,
    ping_interval_seconds: u64,
}

impl ConnectionRegistry {
    pub fn new(
        store: StoreGateway,
        batcher: WriteBehindBatcher,
        gateway_id: String,
        ping_interval_seconds: u64,
    ) -> Self {
        Self {
            store,
            batcher,
            gateway_id,
            ping_interval_seconds,
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Record this replica as host for the session's socket. Called on
    /// socket acceptance, before the welcome frame.
    pub async fn register(&self, session_id: &str) -> AppResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.store
            .hset_multiple(
                &keys::connection_key(session_id),
                &[
                    ("gateway_id".to_string(), self.gateway_id.clone()),
                    ("ws_connected".to_string(), "false".to_string()),
                    ("last_seen".to_string(), now.to_string()),
                ],
            )
            .await
    }

    /// Idempotent per sid; `true` also tracks the sid in the
    /// `connected_users` sorted set scored by last-seen.
    pub async fn mark_connected(&self, session_id: &str, connected: bool) -> AppResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.store
            .hset_multiple(
                &keys::connection_key(session_id),
                &[
                    ("ws_connected".to_string(), connected.to_string()),
                    ("last_seen".to_string(), now.to_string()),
                ],
            )
            .await?;

        if connected {
            self.store
                .zadd(keys::CONNECTED_USERS, session_id, now as f64)
                .await?;
        } else {
            self.store
                .zrem(keys::CONNECTED_USERS, &[session_id.to_string()])
                .await?;
        }
        Ok(())
    }

    /// Heartbeat writes are per-socket and frequent, so they coalesce in
    /// the batcher instead of hitting the store one by one.
    pub async fn heartbeat(&self, session_id: &str) -> AppResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.batcher
            .submit(
                &keys::connection_key(session_id),
                WriteOp::HSet {
                    fields: vec![("last_seen".to_string(), now.to_string())],
                },
            )
            .await?;
        self.batcher
            .submit(
                keys::CONNECTED_USERS,
                WriteOp::ZAdd {
                    member: session_id.to_string(),
                    score: now as f64,
                },
            )
            .await
    }

    /// Unconditionally removes the record and its sorted-set entry.
    pub async fn remove(&self, session_id: &str) -> AppResult<()> {
        self.store.delete(&keys::connection_key(session_id)).await?;
        self.store
            .zrem(keys::CONNECTED_USERS, &[session_id.to_string()])
            .await
    }

    pub async fn lookup(&self, session_id: &str) -> AppResult<Option<Connection>> {
        let fields = self.store.hgetall(&keys::connection_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Connection::from_fields(session_id, &fields))
    }

    /// Remove connection records this replica owns whose last-seen is older
    /// than twice the ping interval: leftovers of a crash or a socket that
    /// vanished without cleanup. Records pinned to other replicas are left
    /// alone.
    pub async fn sweep_stale(&self) -> AppResult<usize> {
        let entries = self.store.zrange_withscores(keys::CONNECTED_USERS).await?;
        let cutoff = chrono::Utc::now().timestamp() - stale_cutoff_seconds(self.ping_interval_seconds);
        let mut removed = 0;

        for (session_id, last_seen) in entries {
            if last_seen as i64 > cutoff {
                continue;
            }
            match self.lookup(&session_id).await? {
                Some(conn) if conn.gateway_id == self.gateway_id => {
                    info!(session_id = %session_id, "Removing stale connection record");
                    self.remove(&session_id).await?;
                    removed += 1;
                }
                // Sorted-set entry with no backing record is an orphan.
                None => {
                    debug!(session_id = %session_id, "Removing orphaned connected_users entry");
                    self.store
                        .zrem(keys::CONNECTED_USERS, &[session_id.clone()])
                        .await?;
                    removed += 1;
                }
                Some(_) => {}
            }
        }
        Ok(removed)
    }
}

pub(crate) fn stale_cutoff_seconds(ping_interval_seconds: u64) -> i64 {
    (ping_interval_seconds * 2) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_field_parsing() {
        let mut fields = HashMap::new();
        fields.insert("gateway_id".to_string(), "gw-1".to_string());
        fields.insert("ws_connected".to_string(), "true".to_string());
        fields.insert("last_seen".to_string(), "1700000000".to_string());

        let conn = Connection::from_fields("s1", &fields).unwrap();
        assert_eq!(conn.gateway_id, "gw-1");
        assert!(conn.ws_connected);
        assert_eq!(conn.last_seen, 1_700_000_000);
    }

    #[test]
    fn test_connection_requires_gateway_id() {
        let mut fields = HashMap::new();
        fields.insert("ws_connected".to_string(), "true".to_string());
        assert!(Connection::from_fields("s1", &fields).is_none());
    }

    #[test]
    fn test_stale_cutoff_is_twice_ping_interval() {
        assert_eq!(stale_cutoff_seconds(25), 50);
        assert_eq!(stale_cutoff_seconds(60), 120);
    }
}
