//! Executor and prepare probe.
//!
//! Takes a classified statement plus resolved parameters, runs it on a
//! pooled session and produces a `ResultPage`. Selects go through the
//! rewriter (pagination, sort, filters, `__total`); data and structure
//! changes execute as-is; EXPLAIN is normalised per the rewriter's rules.
//! Every driver round-trip sits under a cancel-on-drop guard, so a request
//! future dropped by the HTTP layer turns into a server-side CancelRequest
//! and the session is quarantined.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::types::Type;

use crate::db::annotate::CatalogCache;
use crate::db::decode::{self, BoxedParam};
use crate::db::session::{CancelOnDrop, Session};
use crate::db::types::{FilterOp, QueryResult, ResultColumn, ResultPage};
use crate::error::{Error, Result};
use crate::sql::classifier::{self, Statement, StatementKind};
use crate::sql::rewriter::{self, BaseColumn, PageRequest};

fn default_page() -> usize {
    1
}

fn default_page_size() -> i64 {
    -1
}

fn default_use_cache() -> bool {
    true
}

/// Body of `POST /query`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub sort: Option<crate::db::types::Sort>,
    #[serde(default)]
    pub filters: Vec<crate::db::types::Filter>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    /// Opt out of the response cache for this request.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Requested cache lifetime; the server caps it at its own maximum.
    #[serde(default)]
    pub cache_ttl_s: Option<u64>,
}

/// Body of `POST /prepare`'s response.
#[derive(Debug, Serialize)]
pub struct PrepareResponse {
    pub columns: Vec<ResultColumn>,
    pub params: Vec<ParamInfo>,
}

#[derive(Debug, Serialize)]
pub struct ParamInfo {
    pub ordinal: u32,
    /// `$N`, or the declared name from a `$N /* name */` comment.
    pub name: String,
    pub oid: u32,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Classify a script and pick the statement to execute. The response model
/// carries a single result, so only the first statement runs; the rest is
/// logged and skipped.
pub fn first_statement(query: &str) -> Result<Statement> {
    let mut statements = classifier::classify_script(query);
    if statements.is_empty() {
        return Err(Error::BadRequest {
            message: "query contains no statements".into(),
            field: Some("query".into()),
        });
    }
    if statements.len() > 1 {
        tracing::warn!(
            skipped = statements.len() - 1,
            "script contains multiple statements, executing the first"
        );
    }
    Ok(statements.remove(0))
}

/// One statement execution bound to a session and its catalog cache.
pub struct Executor<'a> {
    session: &'a Session,
    catalog: Arc<CatalogCache>,
}

impl<'a> Executor<'a> {
    pub fn new(session: &'a Session, catalog: Arc<CatalogCache>) -> Self {
        Self { session, catalog }
    }

    /// Prepare-only round-trip: parameter and column metadata, nothing
    /// executed.
    pub async fn prepare_probe(&self, query: &str) -> Result<PrepareResponse> {
        let statement = first_statement(query)?;
        let guard = CancelOnDrop::arm(self.session.cancel_handle());
        let prepared = self
            .session
            .client()
            .prepare(&statement.text)
            .await
            .map_err(Error::from);
        guard.disarm();
        let prepared = prepared?;

        let columns = prepared
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| decode::column_meta(idx, col))
            .collect();

        let declared = statement.params;
        let params = prepared
            .params()
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                let ordinal = i as u32 + 1;
                let name = declared
                    .iter()
                    .find(|p| p.ordinal == ordinal)
                    .and_then(|p| p.name.clone())
                    .unwrap_or_else(|| format!("${ordinal}"));
                ParamInfo {
                    ordinal,
                    name,
                    oid: ty.oid(),
                    type_name: ty.name().to_owned(),
                }
            })
            .collect();

        Ok(PrepareResponse { columns, params })
    }

    /// Execute one classified statement.
    pub async fn run_statement(&self, statement: &Statement, req: &QueryRequest) -> Result<ResultPage> {
        let guard = CancelOnDrop::arm(self.session.cancel_handle());
        let result = self.dispatch(statement, req).await;
        guard.disarm();
        result
    }

    async fn dispatch(&self, statement: &Statement, req: &QueryRequest) -> Result<ResultPage> {
        match statement.kind {
            StatementKind::Utility => self.run_utility(statement).await,
            StatementKind::ModifyData | StatementKind::ModifyStructure => {
                self.run_modify(statement, req).await
            }
            StatementKind::Explain => self.run_explain(statement, req).await,
            // unknown statements go to the server as-is; it produces the
            // authoritative error (with a position) or a result
            StatementKind::Select | StatementKind::Unknown => self.run_select(statement, req).await,
        }
    }

    async fn run_utility(&self, statement: &Statement) -> Result<ResultPage> {
        let affected_rows = self
            .session
            .client()
            .execute(statement.text.as_str(), &[])
            .await
            .map_err(Error::from)?;
        if let Some(keyword) = classifier::leading_keyword(&statement.text) {
            self.session.track_transaction_keyword(&keyword);
        }
        Ok(ResultPage::ModifyData { affected_rows })
    }

    async fn run_modify(&self, statement: &Statement, req: &QueryRequest) -> Result<ResultPage> {
        let client = self.session.client();
        let prepared = client.prepare(&statement.text).await.map_err(Error::from)?;
        let params = convert_params(&req.params, prepared.params())?;
        let affected_rows = client
            .execute(&prepared, &decode::dyn_params(&params))
            .await
            .map_err(Error::from)?;

        Ok(match statement.kind {
            StatementKind::ModifyData => ResultPage::ModifyData { affected_rows },
            _ => ResultPage::ModifyStructure,
        })
    }

    async fn run_explain(&self, statement: &Statement, req: &QueryRequest) -> Result<ResultPage> {
        let client = self.session.client();
        let form = rewriter::explain_form(&statement.text)?;
        let prepared = client.prepare(&form.sql).await.map_err(Error::from)?;
        let params = convert_params(&req.params, prepared.params())?;
        let rows = client
            .query(&prepared, &decode::dyn_params(&params))
            .await
            .map_err(Error::from)?;

        let plan = match rows.first() {
            None => String::new(),
            Some(first) => {
                let ty = first.columns()[0].type_();
                if matches!(ty.name(), "json" | "jsonb") {
                    // FORMAT JSON puts the whole plan in the first row
                    let value: Value = first.try_get(0).map_err(Error::from)?;
                    serde_json::to_string(&value).map_err(|e| Error::Internal(e.to_string()))?
                } else {
                    // FORMAT TEXT spreads the plan across the rows
                    rows.iter()
                        .filter_map(|row| row.try_get::<_, String>(0).ok())
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
        };

        Ok(ResultPage::Explain {
            query: form.inner,
            plan,
        })
    }

    async fn run_select(&self, statement: &Statement, req: &QueryRequest) -> Result<ResultPage> {
        let client = self.session.client();

        // probe first: exact error positions, column list for the wrapper
        let base = client.prepare(&statement.text).await.map_err(Error::from)?;

        let wrapper_columns: Vec<BaseColumn> = base
            .columns()
            .iter()
            .map(|col| BaseColumn {
                name: col.name().to_owned(),
                cast_text: !decode::type_supported(col.type_()),
            })
            .collect();

        let page_request = PageRequest {
            page: req.page,
            page_size: req.page_size,
            sort: req.sort.clone(),
            filters: req.filters.clone(),
        };
        let rewritten = rewriter::paginate(
            &statement.text,
            &wrapper_columns,
            base.params().len() as u32,
            &page_request,
        )?;

        let mut params = convert_params(&req.params, base.params())?;
        for filter in &rewritten.bound_filters {
            let wrap_like = matches!(filter.operator, FilterOp::Like | FilterOp::NotLike);
            params.push(decode::filter_to_param(
                &filter.value,
                filter.value_type,
                wrap_like,
            )?);
        }

        let offset = -(rewritten.prefix_len as i64);
        let page_stmt = client
            .prepare(&rewritten.sql)
            .await
            .map_err(|e| Error::from(e).offset_position(offset))?;
        let rows = client
            .query(&page_stmt, &decode::dyn_params(&params))
            .await
            .map_err(|e| Error::from(e).offset_position(offset))?;

        let total_count = match rows.first() {
            Some(row) => row.try_get::<_, i64>(0).map_err(Error::from)? as usize,
            // page beyond the data: no row carries __total, count separately
            None => {
                let count_row = client
                    .query_one(rewritten.count_sql.as_str(), &decode::dyn_params(&params))
                    .await
                    .map_err(|e| Error::from(e).offset_position(offset))?;
                count_row.try_get::<_, i64>(0).map_err(Error::from)? as usize
            }
        };

        let data_rows: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| decode::row_to_json(row, page_stmt.columns(), 1))
            .collect();

        let mut columns: Vec<ResultColumn> = base
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| decode::column_meta(idx, col))
            .collect();
        // provenance is an enrichment; a failed catalog lookup must not sink
        // the result
        if let Err(err) = self.catalog.annotate(client, &mut columns).await {
            tracing::warn!("column annotation failed: {err}");
        }

        let page_count = data_rows.len();
        let total_pages = if req.page_size < 0 {
            1
        } else {
            total_count.div_ceil(req.page_size as usize)
        };

        Ok(ResultPage::Select {
            page: req.page,
            page_size: req.page_size,
            page_count,
            total_count,
            total_pages,
            sort: req.sort.clone(),
            entries: QueryResult {
                columns,
                rows: data_rows,
            },
        })
    }
}

fn convert_params(values: &[Value], types: &[Type]) -> Result<Vec<BoxedParam>> {
    if values.len() != types.len() {
        return Err(Error::BadRequest {
            message: format!("expected {} params, got {}", types.len(), values.len()),
            field: Some("params".into()),
        });
    }
    values
        .iter()
        .zip(types)
        .map(|(value, ty)| decode::json_to_param(value, ty))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_statement_rejects_empty_scripts() {
        assert!(first_statement("").is_err());
        assert!(first_statement(" -- nothing here\n").is_err());
        assert!(first_statement(";;").is_err());
    }

    #[test]
    fn first_statement_takes_the_first() {
        let stmt = first_statement("SELECT 1; DROP TABLE t").unwrap();
        assert_eq!(stmt.text, "SELECT 1");
        assert_eq!(stmt.kind, StatementKind::Select);
    }

    #[test]
    fn query_request_defaults() {
        let req: QueryRequest = serde_json::from_str(r#"{"query":"SELECT 1"}"#).unwrap();
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, -1);
        assert!(req.use_cache);
        assert!(req.params.is_empty());
        assert!(req.filters.is_empty());
    }

    #[test]
    fn param_count_mismatch_is_bad_request() {
        let result = convert_params(&[serde_json::json!(1)], &[]);
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }
}
