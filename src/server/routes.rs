//! HTTP handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::cache::{fingerprint, FingerprintInput};
use crate::config::Connection;
use crate::db::catalog::{self, DdlKind};
use crate::db::executor::{self, Executor, QueryRequest};
use crate::db::types::ResultPage;
use crate::error::{Error, Result};
use crate::server::extract::Routing;
use crate::server::{AppState, SharedState};
use crate::sql::classifier::StatementKind;

/// Budget for `/query` and `/prepare`.
const QUERY_BUDGET: Duration = Duration::from_secs(30);
/// Budget for `/db/*` catalog lookups and version probes.
const CATALOG_BUDGET: Duration = Duration::from_secs(5);

pub async fn get_config(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let connections = state.config.list().await;
    let status = state.registry.statuses().await;
    Json(serde_json::json!({
        "connections": connections,
        "status": status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfig {
    pub connections: Vec<Connection>,
}

pub async fn put_config(
    State(state): State<SharedState>,
    Json(body): Json<UpdateConfig>,
) -> Result<StatusCode> {
    state.config.replace(body.connections).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn connection_info(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let deadline = Instant::now() + CATALOG_BUDGET;
    let resolved = state.registry.resolve(&name).await?;
    let session = state
        .pools
        .acquire(&name, &resolved.connection.database, deadline)
        .await?;
    let info = tokio::time::timeout_at(deadline, catalog::version_info(session.client()))
        .await
        .map_err(|_| Error::Canceled)??;
    Ok(Json(serde_json::json!({ "info": info })))
}

/// Acquire the routed session for a catalog endpoint.
async fn catalog_session(
    state: &AppState,
    routing: &Routing,
    deadline: Instant,
) -> Result<crate::db::pool::PooledSession> {
    let database = routing.database()?.to_owned();
    state
        .pools
        .acquire(&routing.connection, &database, deadline)
        .await
}

pub async fn db_databases(
    State(state): State<SharedState>,
    routing: Routing,
) -> Result<Json<catalog::QueryRows>> {
    let deadline = Instant::now() + CATALOG_BUDGET;
    // default-db routing: this endpoint works before any database is picked
    let resolved = state.registry.resolve(&routing.connection).await?;
    let database = routing
        .database
        .clone()
        .unwrap_or(resolved.connection.database);
    let session = state
        .pools
        .acquire(&routing.connection, &database, deadline)
        .await?;
    let rows = tokio::time::timeout_at(deadline, catalog::list_databases(session.client()))
        .await
        .map_err(|_| Error::Canceled)??;
    Ok(Json(rows))
}

pub async fn db_schemas(
    State(state): State<SharedState>,
    routing: Routing,
) -> Result<Json<catalog::QueryRows>> {
    let deadline = Instant::now() + CATALOG_BUDGET;
    let session = catalog_session(&state, &routing, deadline).await?;
    let rows = tokio::time::timeout_at(deadline, catalog::list_schemas(session.client()))
        .await
        .map_err(|_| Error::Canceled)??;
    Ok(Json(rows))
}

pub async fn db_tables(
    State(state): State<SharedState>,
    routing: Routing,
    Path(schema): Path<String>,
) -> Result<Json<catalog::QueryRows>> {
    let deadline = Instant::now() + CATALOG_BUDGET;
    let session = catalog_session(&state, &routing, deadline).await?;
    let rows = tokio::time::timeout_at(deadline, catalog::list_tables(session.client(), &schema))
        .await
        .map_err(|_| Error::Canceled)??;
    Ok(Json(rows))
}

pub async fn db_columns(
    State(state): State<SharedState>,
    routing: Routing,
    Path((schema, table)): Path<(String, String)>,
) -> Result<Json<catalog::QueryRows>> {
    let deadline = Instant::now() + CATALOG_BUDGET;
    let session = catalog_session(&state, &routing, deadline).await?;
    let rows = tokio::time::timeout_at(
        deadline,
        catalog::list_columns(session.client(), &schema, &table),
    )
    .await
    .map_err(|_| Error::Canceled)??;
    Ok(Json(rows))
}

pub async fn db_ddl(
    State(state): State<SharedState>,
    routing: Routing,
    Path((schema, kind, name)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>> {
    let kind = DdlKind::parse(&kind)?;
    let deadline = Instant::now() + CATALOG_BUDGET;
    let session = catalog_session(&state, &routing, deadline).await?;
    let ddl = tokio::time::timeout_at(
        deadline,
        catalog::ddl(session.client(), kind, &schema, &name),
    )
    .await
    .map_err(|_| Error::Canceled)??;
    Ok(Json(serde_json::json!({ "ddl": ddl })))
}

#[derive(Debug, Deserialize)]
pub struct PrepareBody {
    pub query: String,
}

pub async fn prepare(
    State(state): State<SharedState>,
    routing: Routing,
    Json(body): Json<PrepareBody>,
) -> Result<Json<executor::PrepareResponse>> {
    let database = routing.database()?.to_owned();
    let deadline = Instant::now() + QUERY_BUDGET;
    let session = state
        .pools
        .acquire(&routing.connection, &database, deadline)
        .await?;
    let catalog = state.catalogs.for_db(&routing.connection, &database);
    let exec = Executor::new(&session, catalog);
    let response = tokio::time::timeout_at(deadline, exec.prepare_probe(&body.query))
        .await
        .map_err(|_| Error::Canceled)??;
    Ok(Json(response))
}

pub async fn query(
    State(state): State<SharedState>,
    routing: Routing,
    Json(req): Json<QueryRequest>,
) -> Result<Response> {
    let database = routing.database()?.to_owned();
    let connection = routing.connection.clone();
    let statement = executor::first_statement(&req.query)?;

    let cacheable = matches!(statement.kind, StatementKind::Select | StatementKind::Explain);
    let fp = cacheable.then(|| {
        fingerprint(&FingerprintInput {
            connection: &connection,
            database: &database,
            statement: &statement.text,
            params: &req.params,
            sort: &req.sort,
            filters: &req.filters,
            page: req.page,
            page_size: req.page_size,
        })
    });

    // fast path: a live cached page
    if req.use_cache {
        if let Some(fp) = &fp {
            if let Some(body) = state.cache.get(fp) {
                tracing::debug!(fingerprint = %fp, "cache hit");
                return Ok(json_body(body));
            }
        }
    }

    // single flight: concurrent identical requests share one round-trip
    let flight = fp.as_ref().map(|fp| state.cache.flight(fp));
    let _flight_guard = match &flight {
        Some(flight) => Some(flight.lock().await),
        None => None,
    };
    if req.use_cache {
        if let Some(fp) = &fp {
            if let Some(body) = state.cache.get(fp) {
                state.cache.end_flight(fp);
                return Ok(json_body(body));
            }
        }
    }

    let result = run_query(&state, &connection, &database, &statement, &req).await;
    if let Some(fp) = &fp {
        state.cache.end_flight(fp);
    }
    let page = result?;

    let body = serde_json::to_string(&page).map_err(|e| Error::Internal(e.to_string()))?;
    if let Some(fp) = fp {
        state.cache.put(
            fp,
            &connection,
            &database,
            statement.referenced_tables(),
            body.clone(),
            req.cache_ttl_s.map(Duration::from_secs),
        );
    }
    Ok(json_body(body))
}

async fn run_query(
    state: &AppState,
    connection: &str,
    database: &str,
    statement: &crate::sql::classifier::Statement,
    req: &QueryRequest,
) -> Result<ResultPage> {
    let deadline = Instant::now() + QUERY_BUDGET;
    let session = state.pools.acquire(connection, database, deadline).await?;
    let catalog = state.catalogs.for_db(connection, database);
    let exec = Executor::new(&session, catalog);

    // a lapsed budget drops the executor future; its cancel guard turns that
    // into a driver-level CancelRequest and poisons the session
    let page = tokio::time::timeout_at(deadline, exec.run_statement(statement, req))
        .await
        .map_err(|_| Error::Canceled)??;

    match &page {
        ResultPage::ModifyStructure => {
            tracing::info!(connection, database, "structure change, flushing caches");
            state.cache.invalidate_db(connection, database);
            state.catalogs.invalidate_db(connection, database);
        }
        ResultPage::ModifyData { .. } if statement.kind == StatementKind::ModifyData => {
            let tables = statement.referenced_tables();
            if tables.is_empty() {
                state.cache.invalidate_db(connection, database);
            } else {
                state.cache.invalidate_tables(connection, database, &tables);
            }
        }
        _ => {}
    }

    Ok(page)
}

pub async fn ws_logs(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    let rx = state.logs.subscribe();
    ws.on_upgrade(move |socket| stream_logs(socket, rx))
}

async fn stream_logs(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                if socket.send(Message::Text(line)).await.is_err() {
                    break;
                }
            }
            // bounded backlog: a slow client loses frames, not the producer
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "log subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn json_body(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
