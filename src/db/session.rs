//! A single driver session: a `tokio_postgres::Client`, its connection task
//! and the request-scoped cancellation machinery.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_postgres::{CancelToken, Client};

use crate::config::Connection as ConnectionConfig;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One pooled driver session.
pub struct Session {
    client: Client,
    cancel: CancelToken,
    ssl: bool,
    broken: Arc<AtomicBool>,
    /// Transaction nesting as observed by the executor; a session released
    /// mid-transaction is discarded, never reused.
    txn_depth: Arc<AtomicI32>,
}

impl Session {
    /// Dial the server for `config`, authenticating with `password`, against
    /// the given database (which may differ from the config's default).
    pub async fn connect(
        config: &ConnectionConfig,
        password: &str,
        database: &str,
    ) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.username)
            .password(password)
            .dbname(database)
            .connect_timeout(CONNECT_TIMEOUT);

        let client = if config.ssl {
            let tls = TlsConnector::new()
                .map_err(|err| Error::Unavailable(format!("TLS setup failed: {err}")))?;
            let (client, conn) = pg
                .connect(MakeTlsConnector::new(tls))
                .await
                .map_err(dial_error)?;
            drive_connection(conn);
            client
        } else {
            let (client, conn) = pg
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(dial_error)?;
            drive_connection(conn);
            client
        };

        Ok(Self {
            cancel: client.cancel_token(),
            client,
            ssl: config.ssl,
            broken: Arc::new(AtomicBool::new(false)),
            txn_depth: Arc::new(AtomicI32::new(0)),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A handle that can cancel whatever this session is running and mark
    /// the session unusable, without borrowing the session itself.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
            ssl: self.ssl,
            broken: Arc::clone(&self.broken),
        }
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Track transaction-control statements so the pool can refuse to reuse
    /// a session that is still inside a transaction.
    pub fn track_transaction_keyword(&self, keyword: &str) {
        match keyword {
            "begin" | "start" => {
                self.txn_depth.fetch_add(1, Ordering::SeqCst);
            }
            "commit" | "rollback" | "end" | "abort" => {
                let _ = self
                    .txn_depth
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some((d - 1).max(0)));
            }
            _ => {}
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn_depth.load(Ordering::SeqCst) > 0
    }

    /// Whether the pool may hand this session to another request.
    pub fn is_reusable(&self) -> bool {
        !self.broken.load(Ordering::SeqCst) && !self.client.is_closed() && !self.in_transaction()
    }
}

/// Clonable cancel-and-poison handle for one session.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancelToken,
    ssl: bool,
    broken: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Ask the server to cancel the in-flight statement and mark the session
    /// broken. The CancelRequest runs on its own task; recovery of the
    /// session is not attempted.
    pub fn fire(&self) {
        self.broken.store(true, Ordering::SeqCst);
        let token = self.token.clone();
        let ssl = self.ssl;
        tokio::spawn(async move {
            let result = if ssl {
                match TlsConnector::new() {
                    Ok(tls) => token.cancel_query(MakeTlsConnector::new(tls)).await,
                    Err(err) => {
                        tracing::warn!("cancel request skipped, TLS setup failed: {err}");
                        return;
                    }
                }
            } else {
                token.cancel_query(tokio_postgres::NoTls).await
            };
            if let Err(err) = result {
                tracing::warn!("cancel request failed: {err}");
            }
        });
    }
}

/// Guard that fires a cancel request if dropped while armed. The executor
/// arms one around every driver round-trip; a request future dropped by the
/// HTTP layer (client disconnect, budget timeout) then cancels server-side
/// work instead of leaking it.
pub struct CancelOnDrop {
    handle: CancelHandle,
    armed: bool,
}

impl CancelOnDrop {
    pub fn arm(handle: CancelHandle) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    /// The guarded work finished (successfully or not); do nothing on drop.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.fire();
        }
    }
}

fn drive_connection<S, T>(conn: tokio_postgres::Connection<S, T>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // resolves only when the client is dropped or the link dies
        if let Err(err) = conn.await {
            tracing::debug!("connection task ended: {err}");
        }
    });
}

fn dial_error(err: tokio_postgres::Error) -> Error {
    if let Some(db) = err.as_db_error() {
        // 28xxx = invalid authorization specification / bad password
        if db.code().code().starts_with("28") {
            return Error::AuthFailure(db.message().to_owned());
        }
        return Error::Unavailable(db.message().to_owned());
    }
    Error::Unavailable(err.to_string())
}
