//! Response Cache: fingerprinted pages with LRU + TTL + invalidation.
//!
//! The fingerprint is a SHA-256 digest over the canonical serialization of
//! everything that shapes a response: connection, database, statement text,
//! parameter values, sort, filters and the page window. Requests deserialize
//! into typed structs before fingerprinting, so JSON key order on the wire
//! cannot produce distinct keys. Entries hold the serialized response body;
//! the store is bounded by entry count and by aggregate bytes, evicting
//! least-recently-used first.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::types::{Filter, Sort};

/// Server-side ceiling on entry lifetime; client requests are capped here.
pub const MAX_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ENTRIES: usize = 1024;
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Everything that makes two requests interchangeable.
#[derive(Debug, Serialize)]
pub struct FingerprintInput<'a> {
    pub connection: &'a str,
    pub database: &'a str,
    pub statement: &'a str,
    pub params: &'a [serde_json::Value],
    pub sort: &'a Option<Sort>,
    pub filters: &'a [Filter],
    pub page: usize,
    pub page_size: i64,
}

/// Deterministic request fingerprint (hex SHA-256).
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let canonical = serde_json::to_vec(input).expect("fingerprint input serializes");
    hex::encode(Sha256::digest(&canonical))
}

struct Entry {
    body: String,
    bytes: usize,
    expires_at: Instant,
    last_used: u64,
    connection: String,
    database: String,
    /// Tables the statement referenced, for targeted data-change
    /// invalidation. Empty when extraction found none.
    tables: Vec<String>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    total_bytes: usize,
    clock: u64,
}

/// Process-wide response cache.
pub struct ResponseCache {
    state: Mutex<CacheState>,
    inflight: Mutex<HashMap<String, std::sync::Arc<tokio::sync::Mutex<()>>>>,
    max_entries: usize,
    max_bytes: usize,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES)
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            inflight: Mutex::new(HashMap::new()),
            max_entries,
            max_bytes,
        }
    }

    /// Fetch a live entry's body. Expired entries are dropped on contact.
    pub fn get(&self, fingerprint: &str) -> Option<String> {
        let mut state = self.state.lock().expect("cache lock");
        state.clock += 1;
        let clock = state.clock;

        let live = state
            .entries
            .get(fingerprint)
            .map(|entry| entry.expires_at > Instant::now())?;
        if !live {
            let entry = state.entries.remove(fingerprint).expect("entry present");
            state.total_bytes -= entry.bytes;
            return None;
        }
        let entry = state.entries.get_mut(fingerprint).expect("entry present");
        entry.last_used = clock;
        Some(entry.body.clone())
    }

    /// Store a response body. `ttl` is capped at the server maximum.
    pub fn put(
        &self,
        fingerprint: String,
        connection: &str,
        database: &str,
        tables: Vec<String>,
        body: String,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or(MAX_TTL).min(MAX_TTL);
        let bytes = body.len();
        if bytes > self.max_bytes {
            return;
        }

        let mut state = self.state.lock().expect("cache lock");
        state.clock += 1;
        let clock = state.clock;

        if let Some(old) = state.entries.remove(&fingerprint) {
            state.total_bytes -= old.bytes;
        }
        state.total_bytes += bytes;
        state.entries.insert(
            fingerprint,
            Entry {
                body,
                bytes,
                expires_at: Instant::now() + ttl,
                last_used: clock,
                connection: connection.to_owned(),
                database: database.to_owned(),
                tables,
            },
        );

        while state.entries.len() > self.max_entries || state.total_bytes > self.max_bytes {
            let Some(victim) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = state.entries.remove(&victim) {
                state.total_bytes -= entry.bytes;
            }
        }
    }

    /// Drop every entry of a connection (config change / removal).
    pub fn invalidate_connection(&self, connection: &str) {
        self.retain(|e| e.connection != connection);
    }

    /// Drop every entry of one (connection, database); the structure-change
    /// path.
    pub fn invalidate_db(&self, connection: &str, database: &str) {
        self.retain(|e| !(e.connection == connection && e.database == database));
    }

    /// Data-change invalidation: drop entries of the bucket that reference
    /// any of `tables`. Entries whose statement referenced nothing are kept.
    pub fn invalidate_tables(&self, connection: &str, database: &str, tables: &[String]) {
        self.retain(|e| {
            if e.connection != connection || e.database != database {
                return true;
            }
            !e.tables.iter().any(|t| tables.iter().any(|x| x == t))
        });
    }

    fn retain(&self, keep: impl Fn(&Entry) -> bool) {
        let mut state = self.state.lock().expect("cache lock");
        let mut removed = 0usize;
        state.entries.retain(|_, entry| {
            if keep(entry) {
                true
            } else {
                removed += entry.bytes;
                false
            }
        });
        state.total_bytes -= removed;
    }

    /// Per-fingerprint single-flight lock: the first holder computes, later
    /// holders re-check the cache once the lock is theirs.
    pub fn flight(&self, fingerprint: &str) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().expect("inflight lock");
        std::sync::Arc::clone(
            inflight
                .entry(fingerprint.to_owned())
                .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Forget a single-flight slot once its computation settled.
    pub fn end_flight(&self, fingerprint: &str) {
        self.inflight
            .lock()
            .expect("inflight lock")
            .remove(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(
        statement: &'a str,
        params: &'a [serde_json::Value],
        page: usize,
    ) -> FingerprintInput<'a> {
        FingerprintInput {
            connection: "local",
            database: "postgres",
            statement,
            params,
            sort: &None,
            filters: &[],
            page,
            page_size: 50,
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_scoped() {
        let a = fingerprint(&input("SELECT 1", &[], 1));
        let b = fingerprint(&input("SELECT 1", &[], 1));
        assert_eq!(a, b);
        assert_ne!(a, fingerprint(&input("SELECT 2", &[], 1)));
        assert_ne!(a, fingerprint(&input("SELECT 1", &[], 2)));

        let other_db = FingerprintInput {
            database: "analytics",
            ..input("SELECT 1", &[], 1)
        };
        assert_ne!(a, fingerprint(&other_db));
    }

    #[test]
    fn fingerprint_ignores_wire_key_order() {
        // both spellings deserialize into the same typed values
        let s1: Sort = serde_json::from_str(r#"{"column_idx":0,"direction":"ASC"}"#).unwrap();
        let s2: Sort = serde_json::from_str(r#"{"direction":"ASC","column_idx":0}"#).unwrap();
        let base = input("SELECT 1", &[], 1);
        let a = fingerprint(&FingerprintInput {
            sort: &Some(s1),
            ..base
        });
        let base = input("SELECT 1", &[], 1);
        let b = fingerprint(&FingerprintInput {
            sort: &Some(s2),
            ..base
        });
        assert_eq!(a, b);
    }

    fn put(cache: &ResponseCache, fp: &str, body: &str, tables: &[&str]) {
        cache.put(
            fp.to_owned(),
            "local",
            "postgres",
            tables.iter().map(|s| s.to_string()).collect(),
            body.to_owned(),
            None,
        );
    }

    #[test]
    fn get_put_roundtrip() {
        let cache = ResponseCache::default();
        put(&cache, "fp1", "{\"type\":\"select\"}", &[]);
        assert_eq!(cache.get("fp1").as_deref(), Some("{\"type\":\"select\"}"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn ttl_expiry_drops_entries() {
        let cache = ResponseCache::default();
        cache.put(
            "fp".into(),
            "local",
            "postgres",
            vec![],
            "body".into(),
            Some(Duration::ZERO),
        );
        assert_eq!(cache.get("fp"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn count_bound_evicts_lru() {
        let cache = ResponseCache::new(2, usize::MAX);
        put(&cache, "a", "1", &[]);
        put(&cache, "b", "2", &[]);
        assert!(cache.get("a").is_some()); // refresh a
        put(&cache, "c", "3", &[]);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn byte_bound_evicts_before_count_bound() {
        let cache = ResponseCache::new(100, 10);
        put(&cache, "a", "aaaaaa", &[]); // 6 bytes
        put(&cache, "b", "bbbbbb", &[]); // 6 bytes -> 12 > 10, evict a
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn oversized_body_is_not_stored() {
        let cache = ResponseCache::new(10, 4);
        put(&cache, "a", "too large to cache", &[]);
        assert!(cache.is_empty());
    }

    #[test]
    fn structure_change_purges_the_bucket() {
        let cache = ResponseCache::default();
        put(&cache, "a", "1", &["t"]);
        put(&cache, "b", "2", &[]);
        cache.put(
            "other".into(),
            "local",
            "analytics",
            vec![],
            "3".into(),
            None,
        );
        cache.invalidate_db("local", "postgres");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.get("other").is_some());
    }

    #[test]
    fn data_change_purges_only_matching_tables() {
        let cache = ResponseCache::default();
        put(&cache, "orders", "1", &["orders"]);
        put(&cache, "users", "2", &["users"]);
        put(&cache, "const", "3", &[]);
        cache.invalidate_tables("local", "postgres", &["orders".to_owned()]);
        assert!(cache.get("orders").is_none());
        assert!(cache.get("users").is_some());
        assert!(cache.get("const").is_some());
    }

    #[test]
    fn connection_invalidation_spans_databases() {
        let cache = ResponseCache::default();
        put(&cache, "a", "1", &[]);
        cache.put("b".into(), "local", "analytics", vec![], "2".into(), None);
        cache.invalidate_connection("local");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn flight_lock_serialises_computations() {
        let cache = std::sync::Arc::new(ResponseCache::default());
        let flight = cache.flight("fp");
        let guard = flight.lock().await;

        let cache2 = std::sync::Arc::clone(&cache);
        let waiter = tokio::spawn(async move {
            let flight = cache2.flight("fp");
            let _guard = flight.lock().await;
            // by the time we get the lock, the leader has filled the cache
            cache2.get("fp")
        });

        put(&cache, "fp", "body", &[]);
        drop(guard);
        let hit = waiter.await.unwrap();
        assert_eq!(hit.as_deref(), Some("body"));
        cache.end_flight("fp");
    }
}
