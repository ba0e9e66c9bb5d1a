use axum::{Router, middleware::from_fn, middleware::from_fn_with_state};
use session_gateway::{
    AppState, config::Config, error::AppResult, init_tracing, middleware as gw_middleware, routes,
    ws,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> AppResult<()> {
    let state = AppState::initialize(config).await?;
    state.spawn_sweepers();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = routes::protected_router().layer(from_fn_with_state(
        state.clone(),
        gw_middleware::auth::auth_middleware,
    ));

    let app = Router::new()
        .merge(routes::public_router())
        .merge(protected)
        .merge(ws::create_routes())
        .layer(cors)
        .layer(from_fn_with_state(
            state.clone(),
            gw_middleware::logger::request_deadline,
        ))
        .layer(from_fn(gw_middleware::logger::logger))
        .with_state(state.clone());

    let addr: SocketAddr = state
        .config
        .server_address()
        .parse()
        .map_err(|e| session_gateway::error::AppError::Config(format!("Invalid bind address: {}", e)))?;

    info!(%addr, gateway_id = %state.gateway_id, "Gateway listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| session_gateway::error::AppError::internal(format!("Server error: {}", e)))?;

    shutdown(&state).await;
    Ok(())
}

/// Two-phase shutdown: the server has already stopped accepting; tell every
/// local socket to drain, give them a grace period, then flush the batcher.
async fn shutdown(state: &Arc<AppState>) {
    info!("Shutting down: draining local sockets");
    state.ws_manager.broadcast_shutdown().await;

    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(state.config.drain_grace_seconds);
    while state.ws_manager.count().await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let remaining = state.ws_manager.count().await;
    if remaining > 0 {
        warn!(remaining, "Socket drain grace period elapsed");
    }

    if let Err(e) = state.batcher.drain(Duration::from_secs(10)).await {
        warn!(error = %e, "Batcher drain incomplete");
    }
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
