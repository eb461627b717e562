mod config;
mod ws;

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::{AppState, AppStateInner};
use parley_gateway::auth::JwtAuth;
use parley_gateway::{ConnectionRegistry, MessageRouter, Stores};

use crate::config::Config;
use crate::ws::GatewayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(parley_db::Database::open(&config.db_path)?);

    // Shared state
    let registry = ConnectionRegistry::new(config.registry);
    let router = MessageRouter::new(registry.clone(), Stores::from_database(db.clone()));
    let auth = Arc::new(JwtAuth::new(&config.jwt_secret));

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        auth: auth.clone(),
        router: router.clone(),
    });

    let gateway = GatewayState {
        router,
        auth,
        max_connections: config.max_connections,
    };

    let ws_route = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .merge(parley_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!(
        "Parley server listening on {} (queue depth {}, {} shards, max {} connections)",
        addr, config.registry.queue_depth, config.registry.shards, config.max_connections
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await?;

    let stats = registry.stats();
    info!(
        "Shut down: {} queued, {} dropped offline, {} dropped on backpressure, {} superseded",
        stats.queued, stats.dropped_offline, stats.dropped_backpressure, stats.superseded
    );
    Ok(())
}

/// Resolves on Ctrl-C and closes every live connection so their tasks can
/// finish before the listener stops.
async fn shutdown_signal(registry: ConnectionRegistry) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, closing {} connections", registry.len());
    registry.shutdown();
}
