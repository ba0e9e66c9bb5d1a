use crate::error::{AppError, AppResult};
use crate::session::{Session, merge_json};
use crate::store::{StoreGateway, WriteBehindBatcher, WriteOp, keys};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Create/read/update/delete for sessions, indexed by user. Reads go
/// straight to the store; the hot update path goes through the batcher.
#[derive(Clone)]
pub struct SessionRegistry {
    store: StoreGateway,
    batcher: WriteBehindBatcher,
    gateway_id: String,
    timeout_seconds: u64,
    // Serializes local read-merge-write cycles per sid. Cross-replica
    // conflicts stay last-writer-wins per flush window.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionRegistry {
    pub fn new(
        store: StoreGateway,
        batcher: WriteBehindBatcher,
        gateway_id: String,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            store,
            batcher,
            gateway_id,
            timeout_seconds,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create and persist a session. Emits no event.
    pub async fn create(&self, user_id: &str, chat_id: Option<&str>) -> AppResult<Session> {
        let session = Session::new(user_id, chat_id);

        self.store
            .hset_multiple(&keys::session_key(&session.session_id), &session.to_fields())
            .await?;
        self.store
            .sadd(
                &keys::user_sessions_key(user_id),
                &[session.session_id.clone()],
            )
            .await?;

        debug!(session_id = %session.session_id, user_id, "Created session");
        Ok(session)
    }

    /// Read a session; expired sessions are evicted lazily and read as absent.
    pub async fn get(&self, session_id: &str) -> AppResult<Option<Session>> {
        let fields = self.store.hgetall(&keys::session_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let Some(session) = Session::from_fields(session_id, &fields) else {
            return Ok(None);
        };

        if session.is_expired(self.timeout_seconds, chrono::Utc::now().timestamp()) {
            debug!(session_id, "Evicting expired session on read");
            self.purge(session_id, &session.user_id).await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Read-merge-write of the JSON data blob under a per-sid local lock.
    /// Bumps last-access and publishes a `session_updated` event tagged
    /// with this replica as origin.
    pub async fn update(
        &self,
        session_id: &str,
        patch: &serde_json::Value,
        chat_id: Option<&str>,
    ) -> AppResult<Session> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))?;

        // A null patch means "no data change" (e.g. a chat_id-only update).
        if !patch.is_null() {
            merge_json(&mut session.data, patch);
        }
        if let Some(chat_id) = chat_id {
            if !chat_id.trim().is_empty() {
                session.chat_id = chat_id.to_string();
            }
        }
        session.last_access = chrono::Utc::now().timestamp();

        self.batcher
            .submit(
                &keys::session_key(session_id),
                WriteOp::HSet {
                    fields: vec![
                        ("data".to_string(), session.data.to_string()),
                        ("chat_id".to_string(), session.chat_id.clone()),
                        ("last_access".to_string(), session.last_access.to_string()),
                    ],
                },
            )
            .await?;

        self.publish_event(
            &keys::session_topic(session_id),
            json!({
                "type": "session_updated",
                "session_id": session_id,
                "chat_id": session.chat_id,
                "data": session.data,
                "origin": self.gateway_id,
                "timestamp": session.last_access,
            }),
        )
        .await;

        Ok(session)
    }

    /// Bump last-access only.
    pub async fn touch(&self, session_id: &str) -> AppResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.batcher
            .submit(
                &keys::session_key(session_id),
                WriteOp::HSet {
                    fields: vec![("last_access".to_string(), now.to_string())],
                },
            )
            .await
    }

    /// Delete a session, its index entry, and any connection record, and
    /// publish `session_closed` so the owning socket (on any replica) drains.
    pub async fn delete(&self, session_id: &str) -> AppResult<()> {
        let fields = self.store.hgetall(&keys::session_key(session_id)).await?;
        if fields.is_empty() {
            return Err(AppError::not_found("Session"));
        }
        let user_id = fields.get("user_id").cloned().unwrap_or_default();

        self.purge(session_id, &user_id).await?;

        self.publish_event(
            &keys::session_topic(session_id),
            json!({
                "type": "session_closed",
                "session_id": session_id,
                "origin": self.gateway_id,
            }),
        )
        .await;

        Ok(())
    }

    /// Indexed scan of a user's live sessions.
    pub async fn for_user(&self, user_id: &str) -> AppResult<Vec<Session>> {
        let sids = self
            .store
            .smembers(&keys::user_sessions_key(user_id))
            .await?;

        let mut sessions = Vec::with_capacity(sids.len());
        for sid in sids {
            if let Some(session) = self.get(&sid).await? {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_access));
        Ok(sessions)
    }

    /// Full scan for the admin surface.
    pub async fn all(&self) -> AppResult<Vec<Session>> {
        let session_keys = self.store.keys("sessions:*").await?;
        let mut sessions = Vec::with_capacity(session_keys.len());
        for key in session_keys {
            let Some(sid) = key.strip_prefix("sessions:") else {
                continue;
            };
            if let Some(session) = self.get(sid).await? {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_access));
        Ok(sessions)
    }

    /// Walk the user index and evict sessions idle past the timeout.
    /// Expiry is otherwise lazy; this catches sessions nobody reads.
    pub async fn sweep_expired(&self) -> AppResult<usize> {
        let index_keys = self.store.keys("user_sessions:*").await?;
        let now = chrono::Utc::now().timestamp();
        let mut evicted = 0;

        for index_key in index_keys {
            let Some(user_id) = index_key.strip_prefix("user_sessions:") else {
                continue;
            };
            for sid in self.store.smembers(&index_key).await? {
                let fields = self.store.hgetall(&keys::session_key(&sid)).await?;
                let stale = match Session::from_fields(&sid, &fields) {
                    Some(session) => session.is_expired(self.timeout_seconds, now),
                    // Index entry with no backing session hash.
                    None => true,
                };
                if stale {
                    self.purge(&sid, user_id).await?;
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!(evicted, "Session sweep evicted idle sessions");
        }
        Ok(evicted)
    }

    /// Remove session state without publishing. Shared by delete, lazy
    /// expiry, and the sweeper.
    async fn purge(&self, session_id: &str, user_id: &str) -> AppResult<()> {
        self.store.delete(&keys::session_key(session_id)).await?;
        if !user_id.is_empty() {
            self.store
                .srem(&keys::user_sessions_key(user_id), &[session_id.to_string()])
                .await?;
        }
        self.store.delete(&keys::connection_key(session_id)).await?;
        self.store
            .zrem(keys::CONNECTED_USERS, &[session_id.to_string()])
            .await?;
        self.locks.lock().await.remove(session_id);
        Ok(())
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn publish_event(&self, topic: &str, event: serde_json::Value) {
        if let Err(e) = self.store.publish(topic, &event.to_string()).await {
            warn!(topic, error = %e, "Failed to publish session event");
        }
    }
}
