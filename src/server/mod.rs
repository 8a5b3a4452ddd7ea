//! HTTP/WS surface: shared state, routing and the config-change listener.

pub mod extract;
pub mod logs;
pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::ResponseCache;
use crate::config::ConfigStore;
use crate::db::annotate::CatalogRegistry;
use crate::db::pool::PoolManager;
use crate::db::registry::Registry;
use crate::server::logs::LogChannel;

/// Everything the handlers share.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub registry: Arc<Registry>,
    pub pools: Arc<PoolManager>,
    pub cache: Arc<ResponseCache>,
    pub catalogs: Arc<CatalogRegistry>,
    pub logs: LogChannel,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Arc<ConfigStore>, logs: LogChannel) -> SharedState {
        let registry = Arc::new(Registry::new(Arc::clone(&config)));
        let pools = Arc::new(PoolManager::new(Arc::clone(&registry)));
        Arc::new(Self {
            config,
            registry,
            pools,
            cache: Arc::new(ResponseCache::default()),
            catalogs: Arc::new(CatalogRegistry::default()),
            logs,
        })
    }
}

/// Build the router over shared state.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/config", get(routes::get_config).put(routes::put_config))
        .route("/connections/:name", get(routes::connection_info))
        .route("/db/databases", get(routes::db_databases))
        .route("/db/schemas", get(routes::db_schemas))
        .route("/db/schemas/:schema/tables", get(routes::db_tables))
        .route(
            "/db/schemas/:schema/tables/:table/columns",
            get(routes::db_columns),
        )
        .route("/db/ddl/schemas/:schema/:kind/:name", get(routes::db_ddl))
        .route("/prepare", post(routes::prepare))
        .route("/query", post(routes::query))
        .route("/ws/logs", get(routes::ws_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Consume config-change events: every changed or removed connection loses
/// its pools, cached password, response-cache bucket and catalog cache.
pub fn spawn_config_listener(state: SharedState) {
    let mut rx = state.config.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let name = event.connection();
                    tracing::info!(connection = name, "config changed, tearing down state");
                    state.registry.forget(name).await;
                    state.pools.invalidate_connection(name);
                    state.cache.invalidate_connection(name);
                    state.catalogs.invalidate_connection(name);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
