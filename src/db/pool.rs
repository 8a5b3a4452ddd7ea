//! Pool Manager: lazy, bounded session pools per (connection, database).
//!
//! A pool is created on first use and holds at most `capacity` sessions.
//! Checkout is a semaphore permit plus either an idle session or a fresh
//! dial; dials are serialised per pool so a cold pool under load does not
//! stampede the server. Sessions go back to the pool only when clean — not
//! broken, not closed, not inside a transaction.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::db::registry::{Registry, StatusKind};
use crate::db::session::Session;
use crate::error::{Error, Result};

pub const DEFAULT_CAPACITY: usize = 4;

/// Identity of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub connection: String,
    pub database: String,
}

struct Pool {
    key: PoolKey,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Session>>,
    /// Serialises dials: one connection attempt per pool at a time.
    dial: tokio::sync::Mutex<()>,
    /// Set when the pool is evicted; returning sessions are then discarded.
    closed: AtomicBool,
    /// The first successful dial records the server version.
    version_seen: AtomicBool,
}

/// A checked-out session. Dropping it returns the session to its pool when
/// the session is still clean, otherwise the session is discarded and the
/// slot freed for a fresh dial.
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let session = self.session.take().expect("session present until drop");
        if self.pool.closed.load(Ordering::SeqCst) {
            return;
        }
        if session.is_reusable() {
            self.pool.idle.lock().expect("idle lock").push(session);
        } else {
            tracing::debug!(
                connection = %self.pool.key.connection,
                database = %self.pool.key.database,
                "discarding session (broken, closed or mid-transaction)"
            );
        }
    }
}

/// Owner of every pool in the process.
pub struct PoolManager {
    registry: Arc<Registry>,
    pools: Mutex<HashMap<PoolKey, Arc<Pool>>>,
    capacity: usize,
}

impl PoolManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_capacity(registry, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<Registry>, capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be greater than 0");
        Self {
            registry,
            pools: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Check out a session for (connection, database), dialing lazily. Fails
    /// with `Unavailable` when no session can be produced by `deadline`.
    pub async fn acquire(
        &self,
        connection: &str,
        database: &str,
        deadline: Instant,
    ) -> Result<PooledSession> {
        let resolved = self.registry.resolve(connection).await?;
        let key = PoolKey {
            connection: connection.to_owned(),
            database: database.to_owned(),
        };
        let pool = self.pool_for(&key);

        let permit = tokio::time::timeout_at(deadline, Arc::clone(&pool.slots).acquire_owned())
            .await
            .map_err(|_| pool_timeout(&key))?
            .map_err(|_| Error::Unavailable("pool is shut down".into()))?;

        // fast path: a clean idle session
        loop {
            let candidate = pool.idle.lock().expect("idle lock").pop();
            match candidate {
                Some(session) if session.is_reusable() => {
                    self.registry
                        .note_status(connection, database, StatusKind::Active, None)
                        .await;
                    return Ok(PooledSession {
                        session: Some(session),
                        pool,
                        _permit: permit,
                    });
                }
                // dead idle session; keep looking
                Some(_) => continue,
                None => break,
            }
        }

        // slow path: dial, one attempt at a time per pool
        if !pool.version_seen.load(Ordering::SeqCst) {
            self.registry
                .note_status(connection, database, StatusKind::Pending, None)
                .await;
        }
        let _dial = tokio::time::timeout_at(deadline, pool.dial.lock())
            .await
            .map_err(|_| pool_timeout(&key))?;

        let dialed = tokio::time::timeout_at(
            deadline,
            Session::connect(&resolved.connection, &resolved.password, database),
        )
        .await
        .map_err(|_| pool_timeout(&key))?;

        let session = match dialed {
            Ok(session) => session,
            Err(err) => {
                self.registry
                    .note_status(connection, database, StatusKind::Failed, Some(err.to_string()))
                    .await;
                return Err(err);
            }
        };

        if !pool.version_seen.swap(true, Ordering::SeqCst) {
            match server_version(&session).await {
                Ok(version) => self.registry.note_version(connection, version).await,
                Err(err) => tracing::debug!("version probe failed: {err}"),
            }
        }
        self.registry
            .note_status(connection, database, StatusKind::Active, None)
            .await;
        drop(_dial);

        Ok(PooledSession {
            session: Some(session),
            pool,
            _permit: permit,
        })
    }

    /// Drop every pool belonging to `connection`; idle sessions close
    /// immediately, checked-out ones when their request finishes.
    pub fn invalidate_connection(&self, connection: &str) {
        let mut pools = self.pools.lock().expect("pools lock");
        pools.retain(|key, pool| {
            if key.connection == connection {
                close_pool(pool);
                false
            } else {
                true
            }
        });
    }

    /// Drop the single pool for (connection, database).
    pub fn invalidate_db(&self, connection: &str, database: &str) {
        let key = PoolKey {
            connection: connection.to_owned(),
            database: database.to_owned(),
        };
        if let Some(pool) = self.pools.lock().expect("pools lock").remove(&key) {
            close_pool(&pool);
        }
    }

    /// Close everything; used at shutdown.
    pub fn shutdown(&self) {
        let mut pools = self.pools.lock().expect("pools lock");
        for pool in pools.values() {
            close_pool(pool);
        }
        pools.clear();
    }

    fn pool_for(&self, key: &PoolKey) -> Arc<Pool> {
        let mut pools = self.pools.lock().expect("pools lock");
        Arc::clone(pools.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(
                connection = %key.connection,
                database = %key.database,
                capacity = self.capacity,
                "creating pool"
            );
            Arc::new(Pool {
                key: key.clone(),
                slots: Arc::new(Semaphore::new(self.capacity)),
                idle: Mutex::new(Vec::new()),
                dial: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                version_seen: AtomicBool::new(false),
            })
        }))
    }
}

fn close_pool(pool: &Arc<Pool>) {
    pool.closed.store(true, Ordering::SeqCst);
    pool.idle.lock().expect("idle lock").clear();
    tracing::debug!(
        connection = %pool.key.connection,
        database = %pool.key.database,
        "pool closed"
    );
}

fn pool_timeout(key: &PoolKey) -> Error {
    Error::Unavailable(format!(
        "no session available for {}/{} within the request budget",
        key.connection, key.database
    ))
}

async fn server_version(session: &Session) -> Result<String> {
    let row = session
        .client()
        .query_one("select version()", &[])
        .await
        .map_err(Error::from)?;
    row.try_get::<_, String>(0).map_err(Error::from)
}
