//! Column Annotator: source-table and foreign-key provenance.
//!
//! The driver reports `(relation oid, attribute number)` per result column;
//! this module joins that against `pg_attribute` / `pg_constraint` and fills
//! `ResultColumn::origin`. Lookups are memoized per (connection, database)
//! and flushed together with the response cache whenever a structure change
//! is observed.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio_postgres::Client;

use crate::db::pool::PoolKey;
use crate::db::types::{ColumnOrigin, ResultColumn};
use crate::error::Result;

const ATTRIBUTE_SQL: &str = "
select
  n.nspname,
  a.attrelid,
  a.attnum,
  c.relname,
  a.attname
from pg_attribute a
join pg_class c on a.attrelid = c.oid
join pg_namespace n on c.relnamespace = n.oid
where a.attrelid = any($1)
and a.attnum > 0";

// pg_* catalogs instead of information_schema: constraint_column_usage is
// only visible to the table owner
const FOREIGN_KEY_SQL: &str = "
SELECT
  conname,
  conrelid::regclass::text,
  fa.attname,
  confrelid::regclass::text,
  da.attname
FROM pg_constraint c
JOIN pg_namespace n
  ON n.oid = c.connamespace
CROSS JOIN LATERAL unnest(c.conkey) fk(k)
JOIN pg_attribute fa
  ON fa.attrelid = c.conrelid
  AND fa.attnum = fk.k
CROSS JOIN LATERAL unnest(c.confkey) dk(k)
JOIN pg_attribute da
  ON da.attrelid = c.confrelid
  AND da.attnum = dk.k
WHERE contype = 'f'
AND n.nspname = any($1)
AND conrelid::regclass::text = any($2)";

#[derive(Debug, Clone)]
struct AttrInfo {
    table: String,
    column: String,
}

#[derive(Debug, Clone)]
struct FkInfo {
    constraint: String,
    table: String,
    column: String,
}

#[derive(Default)]
struct CatalogState {
    attrs: HashMap<(u32, i16), AttrInfo>,
    /// Keyed by (source table, source column) like the constraint catalog
    /// reports them.
    fks: HashMap<(String, String), FkInfo>,
    /// Relations whose attributes and constraints are already loaded.
    loaded: HashSet<u32>,
}

/// Per-(connection, database) provenance cache.
#[derive(Default)]
pub struct CatalogCache {
    state: Mutex<CatalogState>,
}

impl CatalogCache {
    /// Fill `origin` on every column that carries provenance ids, fetching
    /// catalog rows for relations not seen before.
    pub async fn annotate(&self, client: &Client, columns: &mut [ResultColumn]) -> Result<()> {
        let wanted: Vec<u32> = {
            let state = self.state.lock().expect("catalog lock");
            columns
                .iter()
                .filter_map(|c| c.table_oid)
                .filter(|oid| !state.loaded.contains(oid))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };

        if !wanted.is_empty() {
            self.load_relations(client, &wanted).await?;
        }

        let state = self.state.lock().expect("catalog lock");
        for col in columns.iter_mut() {
            let (Some(oid), Some(attnum)) = (col.table_oid, col.column_id) else {
                continue;
            };
            let Some(attr) = state.attrs.get(&(oid, attnum)) else {
                continue;
            };
            let mut origin = ColumnOrigin {
                source_table: Some(attr.table.clone()),
                source_column: Some(attr.column.clone()),
                ..Default::default()
            };
            if let Some(fk) = state.fks.get(&(attr.table.clone(), attr.column.clone())) {
                origin.fk_constraint = Some(fk.constraint.clone());
                origin.fk_table = Some(fk.table.clone());
                origin.fk_column = Some(fk.column.clone());
            }
            col.origin = Some(origin);
        }
        Ok(())
    }

    async fn load_relations(&self, client: &Client, oids: &[u32]) -> Result<()> {
        let attr_rows = client.query(ATTRIBUTE_SQL, &[&oids]).await?;

        let mut attrs = Vec::with_capacity(attr_rows.len());
        let mut schemas = HashSet::new();
        let mut tables = HashSet::new();
        for row in &attr_rows {
            let schema: String = row.try_get(0)?;
            let oid: u32 = row.try_get(1)?;
            let attnum: i16 = row.try_get(2)?;
            let table: String = row.try_get(3)?;
            let column: String = row.try_get(4)?;
            schemas.insert(schema);
            tables.insert(table.clone());
            attrs.push(((oid, attnum), AttrInfo { table, column }));
        }

        let mut fks = Vec::new();
        if !tables.is_empty() {
            let schemas: Vec<String> = schemas.into_iter().collect();
            let tables: Vec<String> = tables.into_iter().collect();
            let fk_rows = client.query(FOREIGN_KEY_SQL, &[&schemas, &tables]).await?;
            for row in &fk_rows {
                let constraint: String = row.try_get(0)?;
                let src_table: String = row.try_get(1)?;
                let src_column: String = row.try_get(2)?;
                let dst_table: String = row.try_get(3)?;
                let dst_column: String = row.try_get(4)?;
                fks.push((
                    (src_table, src_column),
                    FkInfo {
                        constraint,
                        table: dst_table,
                        column: dst_column,
                    },
                ));
            }
        }

        let mut state = self.state.lock().expect("catalog lock");
        for (key, info) in attrs {
            state.attrs.insert(key, info);
        }
        for (key, info) in fks {
            state.fks.entry(key).or_insert(info);
        }
        // remember every oid we asked about, even ones that resolved to
        // nothing, so the next request does not re-query
        for oid in oids {
            state.loaded.insert(*oid);
        }
        Ok(())
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("catalog lock");
        *state = CatalogState::default();
    }
}

/// All catalog caches in the process, keyed like the pools.
#[derive(Default)]
pub struct CatalogRegistry {
    caches: Mutex<HashMap<PoolKey, std::sync::Arc<CatalogCache>>>,
}

impl CatalogRegistry {
    pub fn for_db(&self, connection: &str, database: &str) -> std::sync::Arc<CatalogCache> {
        let key = PoolKey {
            connection: connection.to_owned(),
            database: database.to_owned(),
        };
        let mut caches = self.caches.lock().expect("catalog registry lock");
        std::sync::Arc::clone(caches.entry(key).or_default())
    }

    /// Invalidate one (connection, database) cache; runs together with the
    /// response-cache purge on `modify-structure`.
    pub fn invalidate_db(&self, connection: &str, database: &str) {
        let key = PoolKey {
            connection: connection.to_owned(),
            database: database.to_owned(),
        };
        self.caches.lock().expect("catalog registry lock").remove(&key);
    }

    pub fn invalidate_connection(&self, connection: &str) {
        self.caches
            .lock()
            .expect("catalog registry lock")
            .retain(|key, _| key.connection != connection);
    }
}
