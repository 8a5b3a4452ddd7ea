//! Config Store: load, validate and persist connection definitions.
//!
//! The store owns the durable JSON file (an array of connection records) and
//! broadcasts a change event per removed or modified connection so the pool
//! manager and caches can tear down state without holding a back-reference.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::{Error, Result};

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_owned()
}

/// A named database connection definition.
///
/// Exactly one of `password` (a literal) and `password_file` (an executable
/// that prints the password to stdout) must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_file: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub ssl: bool,
}

impl Connection {
    /// The password-resolver command, if one is configured (empty strings
    /// count as absent).
    pub fn password_command(&self) -> Option<&str> {
        self.password_file.as_deref().filter(|s| !s.is_empty())
    }

    fn literal_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|s| !s.is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("connection name must not be empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{}: username must not be empty",
                self.name
            )));
        }
        match (self.literal_password(), self.password_command()) {
            (None, None) => Err(Error::InvalidConfig(format!(
                "{}: either `password` or `password_file` must be set",
                self.name
            ))),
            (Some(_), Some(_)) => Err(Error::InvalidConfig(format!(
                "{}: `password` and `password_file` are mutually exclusive",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Emitted when a connection definition changes; consumers drop every pool,
/// cached password and cache entry tied to the named connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    Changed(String),
    Removed(String),
}

impl ConfigEvent {
    pub fn connection(&self) -> &str {
        match self {
            ConfigEvent::Changed(name) | ConfigEvent::Removed(name) => name,
        }
    }
}

/// Owner of the persisted connection list.
pub struct ConfigStore {
    path: PathBuf,
    connections: RwLock<Vec<Connection>>,
    events: broadcast::Sender<ConfigEvent>,
}

impl ConfigStore {
    /// Load the store from `path`. A missing file starts an empty store; a
    /// malformed one is `InvalidConfig`.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let connections = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<Connection> = serde_json::from_slice(&bytes).map_err(|err| {
                    Error::InvalidConfig(format!("{}: {err}", path.display()))
                })?;
                validate_list(&list)?;
                list
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file yet, starting empty");
                Vec::new()
            }
            Err(err) => {
                return Err(Error::InvalidConfig(format!(
                    "{}: {err}",
                    path.display()
                )))
            }
        };

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            path,
            connections: RwLock::new(connections),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    pub async fn list(&self) -> Vec<Connection> {
        self.connections.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<Connection> {
        self.connections
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Insert or update a single connection by name.
    pub async fn upsert(&self, conn: Connection) -> Result<()> {
        conn.validate()?;
        let mut guard = self.connections.write().await;
        let event = match guard.iter_mut().find(|c| c.name == conn.name) {
            Some(existing) if *existing == conn => None,
            Some(existing) => {
                *existing = conn.clone();
                Some(ConfigEvent::Changed(conn.name.clone()))
            }
            None => {
                guard.push(conn.clone());
                None
            }
        };
        self.persist(&guard).await?;
        drop(guard);
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    /// Remove a connection by name.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut guard = self.connections.write().await;
        let before = guard.len();
        guard.retain(|c| c.name != name);
        if guard.len() == before {
            return Err(Error::InvalidConfig(format!("no such connection: {name}")));
        }
        self.persist(&guard).await?;
        drop(guard);
        let _ = self.events.send(ConfigEvent::Removed(name.to_owned()));
        Ok(())
    }

    /// Replace the whole list (`PUT /config` semantics). Emits one event per
    /// removed or modified connection; untouched ones stay silent.
    pub async fn replace(&self, list: Vec<Connection>) -> Result<()> {
        validate_list(&list)?;

        let mut guard = self.connections.write().await;
        let mut events = Vec::new();
        for old in guard.iter() {
            match list.iter().find(|c| c.name == old.name) {
                None => events.push(ConfigEvent::Removed(old.name.clone())),
                Some(new) if new != old => events.push(ConfigEvent::Changed(old.name.clone())),
                Some(_) => {}
            }
        }
        *guard = list;
        self.persist(&guard).await?;
        drop(guard);

        for event in events {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn persist(&self, list: &[Connection]) -> Result<()> {
        let json = serde_json::to_vec_pretty(list)
            .map_err(|err| Error::Internal(err.to_string()))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|err| Error::Internal(format!("{}: {err}", self.path.display())))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn validate_list(list: &[Connection]) -> Result<()> {
    for (i, conn) in list.iter().enumerate() {
        conn.validate()?;
        if list[..i].iter().any(|c| c.name == conn.name) {
            return Err(Error::InvalidConfig(format!(
                "duplicate connection name: {}",
                conn.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(name: &str) -> Connection {
        Connection {
            name: name.to_owned(),
            host: default_host(),
            port: default_port(),
            username: "postgres".to_owned(),
            password: Some("secret".to_owned()),
            password_file: None,
            database: default_database(),
            ssl: false,
        }
    }

    async fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("connections.json"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let (_dir, store) = store().await;
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_persists_and_reloads() {
        let (_dir, store) = store().await;
        store.upsert(conn("local")).await.unwrap();

        let reloaded = ConfigStore::load(store.path().to_path_buf()).await.unwrap();
        let list = reloaded.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "local");
        assert_eq!(list[0].port, 5432);
    }

    #[tokio::test]
    async fn malformed_file_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(matches!(
            ConfigStore::load(path).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn validation_rejects_bad_records() {
        let (_dir, store) = store().await;

        let mut c = conn("x");
        c.username = String::new();
        assert!(store.upsert(c).await.is_err());

        let mut c = conn("x");
        c.password = None;
        assert!(store.upsert(c).await.is_err());

        let mut c = conn("x");
        c.password_file = Some("/bin/true".into());
        assert!(store.upsert(c).await.is_err());

        let mut c = conn("");
        c.name = String::new();
        assert!(store.upsert(c).await.is_err());
    }

    #[tokio::test]
    async fn replace_rejects_duplicate_names() {
        let (_dir, store) = store().await;
        let err = store.replace(vec![conn("a"), conn("a")]).await;
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn replace_emits_events_for_changed_and_removed() {
        let (_dir, store) = store().await;
        store.replace(vec![conn("a"), conn("b"), conn("c")]).await.unwrap();

        let mut rx = store.subscribe();
        let mut changed = conn("b");
        changed.port = 5433;
        // keep a, change b, drop c
        store.replace(vec![conn("a"), changed]).await.unwrap();

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(events.contains(&ConfigEvent::Changed("b".into())));
        assert!(events.contains(&ConfigEvent::Removed("c".into())));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn upsert_same_content_is_silent() {
        let (_dir, store) = store().await;
        store.upsert(conn("a")).await.unwrap();
        let mut rx = store.subscribe();
        store.upsert(conn("a")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
