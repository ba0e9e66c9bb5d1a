pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pubsub;
pub mod routes;
pub mod session;
pub mod store;
pub mod validation;
pub mod ws;

use crate::auth::{TokenService, UserRegistry};
use crate::config::Config;
use crate::error::AppResult;
use crate::pubsub::EventBus;
use crate::session::{ConnectionRegistry, SessionRegistry};
use crate::store::{StoreGateway, WriteBehindBatcher};
use crate::ws::WsManager;
use std::sync::Arc;
use tracing::error;

/// Process-wide state, built once at startup and passed explicitly.
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway_id: String,
    pub store: StoreGateway,
    pub batcher: WriteBehindBatcher,
    pub tokens: TokenService,
    pub sessions: SessionRegistry,
    pub connections: ConnectionRegistry,
    pub users: UserRegistry,
    pub bus: EventBus,
    pub ws_manager: WsManager,
}

impl AppState {
    pub async fn initialize(config: Config) -> AppResult<Arc<Self>> {
        let config = Arc::new(config);
        let gateway_id = config
            .gateway_id
            .clone()
            .unwrap_or_else(|| format!("gw-{}", uuid::Uuid::new_v4().simple()));

        let store = StoreGateway::connect(&config.store_url).await?;
        let batcher =
            WriteBehindBatcher::new(store.clone(), config.flush_interval(), config.batch_high_water);
        batcher.spawn_flusher();

        let bus = EventBus::start(store.clone());
        let tokens = TokenService::new(config.secret_key.clone(), config.token_ttl_seconds);

        let sessions = SessionRegistry::new(
            store.clone(),
            batcher.clone(),
            gateway_id.clone(),
            config.session_timeout_seconds,
        );
        let connections = ConnectionRegistry::new(
            store.clone(),
            batcher.clone(),
            gateway_id.clone(),
            config.ping_interval_seconds,
        );
        let users = UserRegistry::new(
            store.clone(),
            sessions.clone(),
            tokens.clone(),
            config.clone(),
        );

        Ok(Arc::new(Self {
            config,
            gateway_id,
            store,
            batcher,
            tokens,
            sessions,
            connections,
            users,
            bus,
            ws_manager: WsManager::new(),
        }))
    }

    /// Background maintenance: session expiry sweep and stale-connection
    /// sweep for records this replica owns.
    pub fn spawn_sweepers(self: &Arc<Self>) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                state.config.session_sweep_interval_seconds,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = state.sessions.sweep_expired().await {
                    error!(error = %e, "Session sweep failed");
                }
            }
        });

        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                state.config.stale_sweep_interval_seconds,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = state.connections.sweep_stale().await {
                    error!(error = %e, "Stale-connection sweep failed");
                }
            }
        });
    }
}

pub fn init_tracing(config: &Config) {
    let level = match config.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_max_level(level).init();
        }
        _ => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
}
