use crate::auth::token::{Principal, Role, TokenService};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::session::{Session, SessionRegistry};
use crate::store::{StoreGateway, keys};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Stored user record. The credential verifier never leaves this module.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: i64,
    pub last_login: Option<i64>,
}

impl UserRecord {
    fn from_fields(username: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let password_hash = fields.get("password_hash")?.clone();
        Some(Self {
            username: username.to_string(),
            email: fields.get("email").cloned().unwrap_or_default(),
            password_hash,
            role: Role::parse(fields.get("role").map(String::as_str).unwrap_or("user")),
            created_at: fields
                .get("created_at")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_login: fields.get("last_login").and_then(|v| v.parse().ok()),
        })
    }

    pub fn view(&self) -> UserView {
        UserView {
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role,
            created_at: self.created_at,
            last_login: self.last_login,
        }
    }
}

/// Public projection of a user record.
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: i64,
    pub last_login: Option<i64>,
}

pub struct LoginOutcome {
    pub token: String,
    pub expires_in: u64,
    pub user: UserView,
    pub session: Session,
}

/// User records, credential verification, and the account-level lifecycle
/// operations that fan out to sessions and the user topic.
#[derive(Clone)]
pub struct UserRegistry {
    store: StoreGateway,
    sessions: SessionRegistry,
    tokens: TokenService,
    config: Arc<Config>,
}

impl UserRegistry {
    pub fn new(
        store: StoreGateway,
        sessions: SessionRegistry,
        tokens: TokenService,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            sessions,
            tokens,
            config,
        }
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> AppResult<UserView> {
        let key = keys::user_key(username);
        if !self.store.hgetall(&key).await?.is_empty() {
            return Err(AppError::conflict("Username already exists"));
        }

        let role = if self.config.is_bootstrap_admin(username) {
            Role::Admin
        } else {
            Role::User
        };

        let record = UserRecord {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: bcrypt::hash(password, self.config.bcrypt_cost)?,
            role,
            created_at: chrono::Utc::now().timestamp(),
            last_login: None,
        };

        self.store
            .hset_multiple(
                &key,
                &[
                    ("email".to_string(), record.email.clone()),
                    ("password_hash".to_string(), record.password_hash.clone()),
                    ("role".to_string(), record.role.as_str().to_string()),
                    ("created_at".to_string(), record.created_at.to_string()),
                ],
            )
            .await?;

        info!(username, role = role.as_str(), "Registered user");
        Ok(record.view())
    }

    /// Verify credentials, reuse the freshest session (or create one), and
    /// issue a bearer token.
    pub async fn login(&self, username: &str, password: &str) -> AppResult<LoginOutcome> {
        let record = self
            .fetch(username)
            .await?
            .ok_or_else(|| AppError::unauthorized("Invalid username or password"))?;

        if !bcrypt::verify(password, &record.password_hash)? {
            return Err(AppError::unauthorized("Invalid username or password"));
        }

        let now = chrono::Utc::now().timestamp();
        self.store
            .hset(&keys::user_key(username), "last_login", &now.to_string())
            .await?;

        let session = match self.sessions.for_user(username).await?.into_iter().next() {
            Some(existing) => {
                self.sessions.touch(&existing.session_id).await?;
                existing
            }
            None => self.sessions.create(username, None).await?,
        };

        let (token, _claims) = self.tokens.issue(username, record.role)?;

        let mut record = record;
        record.last_login = Some(now);

        Ok(LoginOutcome {
            token,
            expires_in: self.tokens.ttl_seconds(),
            user: record.view(),
            session,
        })
    }

    pub async fn fetch(&self, username: &str) -> AppResult<Option<UserRecord>> {
        let fields = self.store.hgetall(&keys::user_key(username)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(UserRecord::from_fields(username, &fields))
    }

    /// Delete the principal's sessions (one, or all of them) and tell every
    /// replica hosting one of their sockets to drain it.
    pub async fn logout(&self, principal: &Principal, session_id: Option<&str>) -> AppResult<usize> {
        let mut closed = 0;

        match session_id {
            Some(sid) => {
                self.sessions.delete(sid).await?;
                closed += 1;
            }
            None => {
                for session in self.sessions.for_user(&principal.username).await? {
                    if self.sessions.delete(&session.session_id).await.is_ok() {
                        closed += 1;
                    }
                }
            }
        }

        self.publish_user_event(
            &principal.username,
            json!({
                "type": "logout",
                "user_id": principal.username,
            }),
        )
        .await;

        info!(username = %principal.username, closed, "Logged out");
        Ok(closed)
    }

    /// Admin-only role change; broadcast so live sockets learn immediately.
    pub async fn set_role(&self, username: &str, role: Role) -> AppResult<UserView> {
        let mut record = self
            .fetch(username)
            .await?
            .ok_or_else(|| AppError::not_found("User"))?;

        self.store
            .hset(&keys::user_key(username), "role", role.as_str())
            .await?;
        record.role = role;

        self.publish_user_event(
            username,
            json!({
                "type": "role_changed",
                "user_id": username,
                "role": role.as_str(),
            }),
        )
        .await;

        info!(username, role = role.as_str(), "Changed role");
        Ok(record.view())
    }

    /// Remove the user, every session they own, and their index set, then
    /// publish a logout so any live sockets close.
    pub async fn delete_account(&self, username: &str) -> AppResult<()> {
        if self.fetch(username).await?.is_none() {
            return Err(AppError::not_found("User"));
        }

        for session in self.sessions.for_user(username).await? {
            if let Err(e) = self.sessions.delete(&session.session_id).await {
                warn!(session_id = %session.session_id, error = %e, "Failed to delete session during account removal");
            }
        }

        self.store.delete(&keys::user_sessions_key(username)).await?;
        self.store.delete(&keys::user_key(username)).await?;

        self.publish_user_event(
            username,
            json!({
                "type": "logout",
                "user_id": username,
            }),
        )
        .await;

        info!(username, "Deleted account");
        Ok(())
    }

    /// Full scan for the admin surface.
    pub async fn all(&self) -> AppResult<Vec<UserView>> {
        let user_keys = self.store.keys("users:*").await?;
        let mut users = Vec::with_capacity(user_keys.len());
        for key in user_keys {
            let Some(username) = key.strip_prefix("users:") else {
                continue;
            };
            if let Some(record) = self.fetch(username).await? {
                users.push(record.view());
            }
        }
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn publish_user_event(&self, username: &str, event: serde_json::Value) {
        let topic = keys::user_topic(username);
        if let Err(e) = self.store.publish(&topic, &event.to_string()).await {
            warn!(topic = %topic, error = %e, "Failed to publish user event");
        }
    }
}
