use crate::error::{AppError, AppResult};
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub store_url: String,
    pub secret_key: String,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Stable identity of this replica in connection records. Generated
    /// per-process when unset, which is the normal deployment mode.
    #[serde(default)]
    pub gateway_id: Option<String>,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_seconds: u64,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_batch_high_water")]
    pub batch_high_water: usize,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_seconds: u64,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_seconds: u64,

    #[serde(default = "default_session_sweep_interval")]
    pub session_sweep_interval_seconds: u64,
    #[serde(default = "default_stale_sweep_interval")]
    pub stale_sweep_interval_seconds: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_drain_grace")]
    pub drain_grace_seconds: u64,

    /// Usernames granted the admin role at registration time.
    #[serde(default)]
    pub admin_users: Vec<String>,

    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_token_ttl() -> u64 {
    1800
}
fn default_session_timeout() -> u64 {
    1800
}
fn default_flush_interval() -> u64 {
    100
}
fn default_batch_high_water() -> usize {
    50_000
}
fn default_ping_interval() -> u64 {
    25
}
fn default_pong_timeout() -> u64 {
    30
}
fn default_inactivity_timeout() -> u64 {
    60
}
fn default_session_sweep_interval() -> u64 {
    60
}
fn default_stale_sweep_interval() -> u64 {
    30
}
fn default_request_timeout() -> u64 {
    30
}
fn default_drain_grace() -> u64 {
    5
}
fn default_bcrypt_cost() -> u32 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let config = envy::from_env::<Config>()
            .map_err(|e| AppError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.store_url.trim().is_empty() {
            return Err(AppError::Config("STORE_URL must be set".to_string()));
        }

        if self.secret_key.len() < 16 {
            return Err(AppError::Config(
                "SECRET_KEY must be at least 16 characters".to_string(),
            ));
        }

        if self.token_ttl_seconds == 0 {
            return Err(AppError::Config(
                "TOKEN_TTL_SECONDS must be > 0".to_string(),
            ));
        }

        if self.flush_interval_ms == 0 {
            return Err(AppError::Config(
                "FLUSH_INTERVAL_MS must be > 0".to_string(),
            ));
        }

        if self.pong_timeout_seconds == 0 || self.ping_interval_seconds == 0 {
            return Err(AppError::Config(
                "PING_INTERVAL_SECONDS and PONG_TIMEOUT_SECONDS must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_seconds)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn is_bootstrap_admin(&self, username: &str) -> bool {
        self.admin_users.iter().any(|u| u == username)
    }
}
