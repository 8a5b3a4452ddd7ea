//! Predefined catalog queries backing the `/db/*` surface: database, schema,
//! table and column listings plus DDL reconstruction.

use std::collections::HashMap;

use serde_json::Value;
use tokio_postgres::Client;

use crate::db::decode;
use crate::error::{Error, Result};

/// Rows keyed by column name, the shape the catalog endpoints return.
pub type QueryRows = Vec<HashMap<String, Value>>;

/// Run one catalog query and map its rows to JSON objects.
async fn json_rows(
    client: &Client,
    sql: &str,
    params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
) -> Result<QueryRows> {
    let stmt = client.prepare(sql).await?;
    let rows = client.query(&stmt, params).await?;
    let columns = stmt.columns();
    Ok(rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, col)| {
                    (
                        col.name().to_owned(),
                        decode::cell_to_json(row, idx, col.type_()),
                    )
                })
                .collect()
        })
        .collect())
}

/// `select version()`, shown as the connection's info line.
pub async fn version_info(client: &Client) -> Result<String> {
    let row = client.query_one("select version()", &[]).await?;
    Ok(row.try_get(0)?)
}

pub async fn list_databases(client: &Client) -> Result<QueryRows> {
    let sql = "
    SELECT datname, pg_encoding_to_char(encoding) AS encoding,
           pg_size_pretty(pg_database_size(datname)) AS size_pretty
    FROM pg_database
    WHERE datallowconn
    AND datname NOT IN ('template0', 'template1')
    ORDER BY datname";
    json_rows(client, sql, &[]).await
}

pub async fn list_schemas(client: &Client) -> Result<QueryRows> {
    let sql = "
    SELECT schema_name, schema_owner
    FROM information_schema.schemata
    WHERE schema_name NOT IN ('pg_catalog', 'pg_toast', 'information_schema')
    ORDER BY schema_name";
    json_rows(client, sql, &[]).await
}

/// Tables and views of a schema, with row estimates and on-disk sizes for
/// the tables.
pub async fn list_tables(client: &Client, schema: &str) -> Result<QueryRows> {
    let table_sql = "
    SELECT
      'table' AS type,
      t.table_schema,
      t.table_name,
      c.reltuples AS table_rows_est,
      pg_total_relation_size(c.oid) AS table_size,
      pg_size_pretty(pg_total_relation_size(c.oid)) AS table_size_pretty
    FROM information_schema.tables t
    JOIN pg_namespace n ON n.nspname = t.table_schema
    JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = t.table_name
    WHERE t.table_schema = $1
    AND t.table_type = 'BASE TABLE'
    ORDER BY t.table_name";

    let view_sql = "
    SELECT
      'view' AS type,
      v.table_schema,
      v.table_name,
      c.reltuples AS table_rows_est,
      -1::bigint AS table_size,
      null::text AS table_size_pretty
    FROM information_schema.views v
    JOIN pg_namespace n ON n.nspname = v.table_schema
    JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = v.table_name
    WHERE v.table_schema = $1
    ORDER BY v.table_name";

    let (tables, views) = futures::future::try_join(
        json_rows(client, table_sql, &[&schema]),
        json_rows(client, view_sql, &[&schema]),
    )
    .await?;

    Ok(tables.into_iter().chain(views).collect())
}

pub async fn list_columns(client: &Client, schema: &str, table: &str) -> Result<QueryRows> {
    let sql = "
    SELECT column_name, data_type, is_nullable, column_default, ordinal_position
    FROM information_schema.columns
    WHERE table_schema = $1
    AND table_name = $2
    ORDER BY ordinal_position";
    json_rows(client, sql, &[&schema, &table]).await
}

/// Kinds of object `ddl()` can reconstruct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    Table,
    View,
    MaterializedView,
}

impl DdlKind {
    pub fn parse(kind: &str) -> Result<Self> {
        match kind {
            "table" => Ok(DdlKind::Table),
            "view" => Ok(DdlKind::View),
            "materialized-view" => Ok(DdlKind::MaterializedView),
            other => Err(Error::bad_request(format!(
                "unknown ddl kind `{other}`, expected table, view or materialized-view"
            ))),
        }
    }
}

pub async fn ddl(client: &Client, kind: DdlKind, schema: &str, name: &str) -> Result<String> {
    match kind {
        DdlKind::Table => table_ddl(client, schema, name).await,
        DdlKind::View => view_ddl(client, schema, name).await,
        DdlKind::MaterializedView => materialized_view_ddl(client, schema, name).await,
    }
}

/// Reassemble a CREATE TABLE statement from information_schema plus the
/// table's indexes.
async fn table_ddl(client: &Client, schema: &str, table: &str) -> Result<String> {
    let columns_sql = "
    SELECT
      column_name,
      column_default,
      is_nullable,
      data_type,
      character_maximum_length,
      numeric_precision,
      numeric_scale
    FROM information_schema.columns
    WHERE table_schema = $1
    AND table_name = $2
    ORDER BY ordinal_position";

    let indexes_sql = "
    SELECT indexname, indexdef
    FROM pg_indexes
    WHERE schemaname = $1
    AND tablename = $2";

    let (columns, mut indexes) = futures::future::try_join(
        json_rows(client, columns_sql, &[&schema, &table]),
        json_rows(client, indexes_sql, &[&schema, &table]),
    )
    .await?;

    if columns.is_empty() {
        return Err(Error::bad_request(format!(
            "no such table: {schema}.{table}"
        )));
    }

    // primary key column comes from parsing the _pkey index definition,
    // e.g. `CREATE UNIQUE INDEX t_pkey ON public.t USING btree (id)`
    let pkey_column = indexes
        .iter()
        .position(|i| {
            i["indexname"]
                .as_str()
                .is_some_and(|n| n.ends_with("_pkey"))
        })
        .map(|i| indexes.remove(i))
        .and_then(|index| {
            let def = index["indexdef"].as_str()?.to_owned();
            let open = def.find('(')?;
            let close = def.rfind(')')?;
            (open < close).then(|| def[open + 1..close].to_owned())
        });

    let column_defs = columns
        .iter()
        .map(|row| {
            let name = row["column_name"].as_str().unwrap_or_default();
            let mut data_type = row["data_type"].as_str().unwrap_or_default().to_owned();

            let mut suffix = String::new();
            if let Some(precision) = row["numeric_precision"].as_i64() {
                // integer widths rename the type; decimals use (p, s)
                match (data_type.as_str(), precision) {
                    ("smallint", _) | ("bigint", _) | ("integer", 32) => {}
                    ("integer", 16) => data_type = "smallint".into(),
                    ("integer", 64) => data_type = "bigint".into(),
                    ("integer", _) => {}
                    _ => {
                        let scale = row["numeric_scale"].as_i64().unwrap_or(0);
                        suffix = format!("({precision}, {scale})");
                    }
                }
            } else if let Some(len) = row["character_maximum_length"].as_i64() {
                suffix = format!("({len})");
            }

            let mut def = format!("{name} {data_type}{suffix}");
            if pkey_column.as_deref() == Some(name) {
                def.push_str(" PRIMARY KEY");
            }
            if row["is_nullable"].as_str() == Some("NO") {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = row["column_default"].as_str() {
                def.push_str(&format!(" DEFAULT {default}"));
            }
            def
        })
        .collect::<Vec<_>>();

    let mut ddl = format!("CREATE TABLE {table} (\n  {}\n);", column_defs.join(",\n  "));
    if !indexes.is_empty() {
        let index_defs = indexes
            .iter()
            .filter_map(|i| i["indexdef"].as_str())
            .map(|def| format!("{def};"))
            .collect::<Vec<_>>()
            .join("\n");
        ddl.push_str(&format!("\n\n{index_defs}"));
    }
    Ok(ddl)
}

async fn view_ddl(client: &Client, schema: &str, view: &str) -> Result<String> {
    let sql = "
    SELECT view_definition
    FROM information_schema.views
    WHERE table_schema = $1
    AND table_name = $2";
    let rows = json_rows(client, sql, &[&schema, &view]).await?;
    rows.first()
        .and_then(|row| row["view_definition"].as_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::bad_request(format!("no such view: {schema}.{view}")))
}

async fn materialized_view_ddl(client: &Client, schema: &str, view: &str) -> Result<String> {
    let sql = "
    SELECT definition
    FROM pg_matviews
    WHERE schemaname = $1
    AND matviewname = $2";
    let rows = json_rows(client, sql, &[&schema, &view]).await?;
    rows.first()
        .and_then(|row| row["definition"].as_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            Error::bad_request(format!("no such materialized view: {schema}.{view}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_kind_parses_path_segments() {
        assert_eq!(DdlKind::parse("table").unwrap(), DdlKind::Table);
        assert_eq!(DdlKind::parse("view").unwrap(), DdlKind::View);
        assert_eq!(
            DdlKind::parse("materialized-view").unwrap(),
            DdlKind::MaterializedView
        );
        assert!(DdlKind::parse("sequence").is_err());
    }
}
