//! Connection Registry: per-connection runtime state.
//!
//! Owns resolved passwords (never persisted), the observed server version
//! and the per-(connection, database) status the UI shows next to each
//! connection. Config changes flow in as events and erase everything known
//! about the affected connection, cached password included.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{ConfigStore, Connection};
use crate::config::resolver;
use crate::error::{Error, Result};

/// Status of one (connection, database) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Pending,
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStatus {
    pub state: StatusKind,
    pub message: Option<String>,
}

/// One row of the status report exposed through `GET /config`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub connection: String,
    pub database: String,
    pub state: StatusKind,
    pub message: Option<String>,
    pub version: Option<String>,
}

/// A connection definition plus its usable password.
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub connection: Connection,
    pub password: String,
}

#[derive(Default)]
struct ConnState {
    password: Option<String>,
    version: Option<String>,
    status_by_db: HashMap<String, DbStatus>,
}

/// Registry of per-connection runtime state.
pub struct Registry {
    store: std::sync::Arc<ConfigStore>,
    inner: RwLock<HashMap<String, ConnState>>,
}

impl Registry {
    pub fn new(store: std::sync::Arc<ConfigStore>) -> Self {
        Self {
            store,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a connection and produce a usable password, running the
    /// password command if one is configured. Resolved passwords are cached
    /// until the connection definition changes.
    pub async fn resolve(&self, name: &str) -> Result<ResolvedConnection> {
        let connection = self.store.get(name).await.ok_or_else(|| Error::BadRequest {
            message: format!("unknown connection: {name}"),
            field: Some("x-conn-name".into()),
        })?;

        if let Some(cached) = self
            .inner
            .read()
            .await
            .get(name)
            .and_then(|s| s.password.clone())
        {
            return Ok(ResolvedConnection {
                connection,
                password: cached,
            });
        }

        let password = match (&connection.password, connection.password_command()) {
            (Some(literal), None) if !literal.is_empty() => literal.clone(),
            (_, Some(command)) => resolver::resolve_command(command).await?,
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "{name}: no password source configured"
                )))
            }
        };

        let mut guard = self.inner.write().await;
        guard.entry(name.to_owned()).or_default().password = Some(password.clone());

        Ok(ResolvedConnection {
            connection,
            password,
        })
    }

    /// Erase everything known about a connection. Called when its definition
    /// changes or it is removed from the config.
    pub async fn forget(&self, name: &str) {
        self.inner.write().await.remove(name);
    }

    pub async fn note_status(
        &self,
        connection: &str,
        database: &str,
        state: StatusKind,
        message: Option<String>,
    ) {
        let mut guard = self.inner.write().await;
        guard
            .entry(connection.to_owned())
            .or_default()
            .status_by_db
            .insert(database.to_owned(), DbStatus { state, message });
    }

    pub async fn note_version(&self, connection: &str, version: String) {
        let mut guard = self.inner.write().await;
        guard.entry(connection.to_owned()).or_default().version = Some(version);
    }

    pub async fn version(&self, connection: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(connection)
            .and_then(|s| s.version.clone())
    }

    /// Flattened status report for every known (connection, database) pair.
    pub async fn statuses(&self) -> Vec<StatusEntry> {
        let guard = self.inner.read().await;
        let mut out = Vec::new();
        for (connection, state) in guard.iter() {
            for (database, status) in state.status_by_db.iter() {
                out.push(StatusEntry {
                    connection: connection.clone(),
                    database: database.clone(),
                    state: status.state,
                    message: status.message.clone(),
                    version: state.version.clone(),
                });
            }
        }
        out.sort_by(|a, b| (&a.connection, &a.database).cmp(&(&b.connection, &b.database)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn registry_with(conns: Vec<Connection>) -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("c.json")).await.unwrap();
        store.replace(conns).await.unwrap();
        (dir, Registry::new(Arc::new(store)))
    }

    fn literal_conn(name: &str) -> Connection {
        Connection {
            name: name.into(),
            host: "localhost".into(),
            port: 5432,
            username: "u".into(),
            password: Some("pw".into()),
            password_file: None,
            database: "postgres".into(),
            ssl: false,
        }
    }

    #[tokio::test]
    async fn resolves_literal_password() {
        let (_dir, registry) = registry_with(vec![literal_conn("a")]).await;
        let resolved = registry.resolve("a").await.unwrap();
        assert_eq!(resolved.password, "pw");
    }

    #[tokio::test]
    async fn unknown_connection_is_bad_request() {
        let (_dir, registry) = registry_with(vec![]).await;
        assert!(matches!(
            registry.resolve("nope").await,
            Err(Error::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn forget_drops_cached_password() {
        let (_dir, registry) = registry_with(vec![literal_conn("a")]).await;
        registry.resolve("a").await.unwrap();
        assert!(registry.inner.read().await.get("a").is_some());
        registry.forget("a").await;
        assert!(registry.inner.read().await.get("a").is_none());
    }

    #[tokio::test]
    async fn status_report_is_sorted_and_versioned() {
        let (_dir, registry) = registry_with(vec![literal_conn("a")]).await;
        registry.note_version("a", "PostgreSQL 16.1".into()).await;
        registry
            .note_status("a", "postgres", StatusKind::Active, None)
            .await;
        registry
            .note_status("a", "analytics", StatusKind::Failed, Some("boom".into()))
            .await;

        let entries = registry.statuses().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].database, "analytics");
        assert_eq!(entries[0].state, StatusKind::Failed);
        assert_eq!(entries[1].version.as_deref(), Some("PostgreSQL 16.1"));
    }
}
