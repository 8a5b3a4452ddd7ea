//! Select rewriting: pagination, ordering, filtering and the total count in
//! one round-trip.
//!
//! The user's text is never edited. It becomes the body of a CTE whose
//! column list renames every output column to `"idx.name"`, which both
//! disambiguates duplicate names and gives filters a stable target. The
//! outer select projects the original names back, degrades exotic types to
//! text, and carries the total count as a leading `__total` column that the
//! executor strips before building the response.

use crate::db::types::{Filter, Sort};
use crate::error::{Error, Result};

/// Synthetic leading column carrying the filtered total count.
pub const TOTAL_COLUMN: &str = "__total";

/// A base-statement output column as seen by the prepare probe.
#[derive(Debug, Clone)]
pub struct BaseColumn {
    pub name: String,
    /// Project with a `::text` cast because the decoder has no native
    /// representation for the column's type.
    pub cast_text: bool,
}

/// Pagination/sort/filter parameters for one rewrite.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// 1-indexed page.
    pub page: usize,
    /// Rows per page, or -1 to fetch everything.
    pub page_size: i64,
    pub sort: Option<Sort>,
    pub filters: Vec<Filter>,
}

/// A wrapped, pageable query.
#[derive(Debug)]
pub struct Rewritten {
    pub sql: String,
    /// Count-only variant over the same CTEs with the same parameters; used
    /// when the requested page lies beyond the data and no row carries
    /// `__total`.
    pub count_sql: String,
    /// Bytes the wrapper inserted before the user's text; driver error
    /// positions inside the wrapped query shift back by this much.
    pub prefix_len: usize,
    /// Filters that bind a value, in placeholder order. Their placeholders
    /// continue numbering after the statement's own `$N` parameters.
    pub bound_filters: Vec<Filter>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The rewriter's internal alias for column `idx` named `name`.
pub fn col_alias(idx: usize, name: &str) -> String {
    quote_ident(&format!("{idx}.{name}"))
}

/// Wrap a select for paginated display.
///
/// `first_filter_param` is the highest `$N` ordinal the statement itself
/// uses; filter placeholders start right after it.
pub fn paginate(
    statement: &str,
    columns: &[BaseColumn],
    first_filter_param: u32,
    req: &PageRequest,
) -> Result<Rewritten> {
    if columns.is_empty() {
        return Err(Error::bad_request("statement produces no columns"));
    }
    if req.page < 1 {
        return Err(Error::BadRequest {
            message: "page must be >= 1".into(),
            field: Some("page".into()),
        });
    }
    if req.page_size != -1 && req.page_size < 1 {
        return Err(Error::BadRequest {
            message: "page_size must be >= 1 or -1".into(),
            field: Some("page_size".into()),
        });
    }
    if let Some(sort) = &req.sort {
        if sort.column_idx >= columns.len() {
            return Err(Error::BadRequest {
                message: format!(
                    "sort column {} out of range ({} columns)",
                    sort.column_idx,
                    columns.len()
                ),
                field: Some("sort".into()),
            });
        }
    }
    for filter in &req.filters {
        filter.validate(columns.len())?;
    }

    let cte_columns = columns
        .iter()
        .enumerate()
        .map(|(i, c)| col_alias(i, &c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let projection = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let cast = if c.cast_text { "::text" } else { "" };
            format!("{}{} AS {}", col_alias(i, &c.name), cast, quote_ident(&c.name))
        })
        .collect::<Vec<_>>()
        .join(", ");

    let prefix = format!("WITH base ({cte_columns}) AS (\n");

    let mut bound_filters = Vec::new();
    let mut clauses = Vec::new();
    let mut next_param = first_filter_param;
    for filter in &req.filters {
        let target = col_alias(filter.index, &filter.column);
        let op = filter.operator.sql_op();
        if filter.operator.binds_value() {
            next_param += 1;
            clauses.push(format!(
                "{target} {op} ${next_param}::{cast}",
                cast = filter.value_type.sql_cast()
            ));
            bound_filters.push(filter.clone());
        } else {
            clauses.push(format!("{target} {op}"));
        }
    }

    let (source, filter_cte) = if clauses.is_empty() {
        ("base", String::new())
    } else {
        (
            "filtered",
            format!(
                ", filtered AS (SELECT * FROM base WHERE {})",
                clauses.join(" AND ")
            ),
        )
    };

    let count_sql = format!(
        "{prefix}{statement}\n){filter_cte}\nSELECT count(*) FROM {source}"
    );

    let mut sql = format!(
        "{prefix}{statement}\n){filter_cte}\nSELECT (SELECT count(*) FROM {source}) AS {TOTAL_COLUMN}, {projection} FROM {source}"
    );

    if let Some(sort) = &req.sort {
        // positional ordinal; +2 skips past __total
        sql.push_str(&format!(
            "\nORDER BY {} {}",
            sort.column_idx + 2,
            sort.direction
        ));
    }

    if req.page_size != -1 {
        let limit = req.page_size;
        let offset = (req.page as i64 - 1) * limit;
        sql.push_str(&format!("\nLIMIT {limit} OFFSET {offset}"));
    }

    Ok(Rewritten {
        prefix_len: prefix.len(),
        sql,
        count_sql,
        bound_filters,
    })
}

/// How an `explain`-classified statement should reach the server.
#[derive(Debug, PartialEq)]
pub struct ExplainForm {
    pub sql: String,
    /// The statement being explained, with the EXPLAIN prefix stripped.
    pub inner: String,
    /// True when the rewriter added `(FORMAT JSON, ANALYZE false)`, i.e. the
    /// plan arrives as a single JSON row.
    pub json_format: bool,
}

/// Normalise an EXPLAIN statement. A bare `EXPLAIN <stmt>` is upgraded to
/// `EXPLAIN (FORMAT JSON, ANALYZE false) <stmt>`; any user-written options
/// or modifiers (`EXPLAIN ANALYZE`, `EXPLAIN (BUFFERS)`, ...) pass through
/// verbatim and produce text-format output.
pub fn explain_form(statement: &str) -> Result<ExplainForm> {
    let rest = skip_leading_trivia(statement)
        .strip_prefix_ignore_case("explain")
        .ok_or_else(|| Error::bad_request("not an EXPLAIN statement"))?;

    let trimmed = rest.trim_start();
    let has_options = trimmed.starts_with('(')
        || starts_with_word(trimmed, "analyze")
        || starts_with_word(trimmed, "analyse")
        || starts_with_word(trimmed, "verbose");

    if has_options {
        let inner = strip_explain_modifiers(trimmed);
        return Ok(ExplainForm {
            sql: statement.to_owned(),
            inner: inner.to_owned(),
            json_format: false,
        });
    }

    Ok(ExplainForm {
        sql: format!("EXPLAIN (FORMAT JSON, ANALYZE false) {trimmed}"),
        inner: trimmed.to_owned(),
        json_format: true,
    })
}

/// Step over leading whitespace and comments.
fn skip_leading_trivia(mut text: &str) -> &str {
    loop {
        let t = text.trim_start();
        if let Some(rest) = t.strip_prefix("--") {
            match rest.find('\n') {
                Some(nl) => text = &rest[nl + 1..],
                None => return "",
            }
        } else if t.starts_with("/*") {
            let bytes = t.as_bytes();
            let mut depth = 0usize;
            let mut i = 0usize;
            let mut after = None;
            while i + 1 < bytes.len() {
                if bytes[i] == b'/' && bytes[i + 1] == b'*' {
                    depth += 1;
                    i += 2;
                } else if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        after = Some(i);
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            match after {
                Some(end) => text = &t[end..],
                // unterminated comment
                None => return "",
            }
        } else {
            return t;
        }
    }
}

fn starts_with_word(text: &str, word: &str) -> bool {
    let Some(rest) = text.strip_prefix_ignore_case(word) else {
        return false;
    };
    rest.chars().next().map_or(true, |c| !c.is_alphanumeric() && c != '_')
}

fn strip_explain_modifiers(mut text: &str) -> &str {
    if text.starts_with('(') {
        if let Some(close) = text.find(')') {
            text = text[close + 1..].trim_start();
        }
    }
    loop {
        let lower = text.trim_start();
        let mut stripped = false;
        for word in ["analyze", "analyse", "verbose"] {
            if starts_with_word(lower, word) {
                text = lower[word.len()..].trim_start();
                stripped = true;
                break;
            }
        }
        if !stripped {
            return lower;
        }
    }
}

trait StripPrefixIgnoreCase {
    fn strip_prefix_ignore_case<'a>(&'a self, prefix: &str) -> Option<&'a str>;
}

impl StripPrefixIgnoreCase for str {
    fn strip_prefix_ignore_case<'a>(&'a self, prefix: &str) -> Option<&'a str> {
        match self.get(..prefix.len()) {
            Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&self[prefix.len()..]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::{FilterOp, FilterValueType, SortDirection};

    fn cols(names: &[&str]) -> Vec<BaseColumn> {
        names
            .iter()
            .map(|n| BaseColumn {
                name: (*n).to_owned(),
                cast_text: false,
            })
            .collect()
    }

    fn plain_request(page: usize, page_size: i64) -> PageRequest {
        PageRequest {
            page,
            page_size,
            sort: None,
            filters: Vec::new(),
        }
    }

    #[test]
    fn wraps_with_total_and_window() {
        let rw = paginate("SELECT 1 AS x", &cols(&["x"]), 0, &plain_request(1, 10)).unwrap();
        assert_eq!(
            rw.sql,
            "WITH base (\"0.x\") AS (\nSELECT 1 AS x\n)\n\
             SELECT (SELECT count(*) FROM base) AS __total, \"0.x\" AS \"x\" FROM base\n\
             LIMIT 10 OFFSET 0"
        );
        assert_eq!(rw.prefix_len, "WITH base (\"0.x\") AS (\n".len());
    }

    #[test]
    fn second_page_offsets() {
        let rw = paginate("SELECT n FROM t", &cols(&["n"]), 0, &plain_request(2, 3)).unwrap();
        assert!(rw.sql.ends_with("LIMIT 3 OFFSET 3"));
    }

    #[test]
    fn download_all_omits_window() {
        let rw = paginate("SELECT n FROM t", &cols(&["n"]), 0, &plain_request(1, -1)).unwrap();
        assert!(!rw.sql.contains("LIMIT"));
        assert!(!rw.sql.contains("OFFSET"));
    }

    #[test]
    fn sort_is_positional_past_total() {
        let mut req = plain_request(1, 10);
        req.sort = Some(Sort {
            column_idx: 1,
            direction: SortDirection::Desc,
        });
        let rw = paginate("SELECT a, b FROM t", &cols(&["a", "b"]), 0, &req).unwrap();
        assert!(rw.sql.contains("ORDER BY 3 DESC"));
    }

    #[test]
    fn filters_go_through_a_second_cte() {
        let mut req = plain_request(1, 10);
        req.filters = vec![Filter {
            value_type: FilterValueType::Integer,
            index: 0,
            column: "id".into(),
            operator: FilterOp::Gte,
            value: serde_json::json!(10),
        }];
        let rw = paginate("SELECT id FROM t WHERE x = $1", &cols(&["id"]), 1, &req).unwrap();
        assert!(rw
            .sql
            .contains(", filtered AS (SELECT * FROM base WHERE \"0.id\" >= $2::int8)"));
        assert!(rw.sql.contains("count(*) FROM filtered"));
        assert_eq!(rw.bound_filters.len(), 1);
    }

    #[test]
    fn null_filter_binds_nothing() {
        let mut req = plain_request(1, 10);
        req.filters = vec![Filter {
            value_type: FilterValueType::Text,
            index: 0,
            column: "name".into(),
            operator: FilterOp::Null,
            value: serde_json::Value::Null,
        }];
        let rw = paginate("SELECT name FROM t", &cols(&["name"]), 0, &req).unwrap();
        assert!(rw.sql.contains("\"0.name\" IS NULL"));
        assert!(rw.bound_filters.is_empty());
    }

    #[test]
    fn exotic_columns_degrade_to_text() {
        let columns = vec![
            BaseColumn {
                name: "id".into(),
                cast_text: false,
            },
            BaseColumn {
                name: "pt".into(),
                cast_text: true,
            },
        ];
        let rw = paginate("SELECT id, pt FROM t", &columns, 0, &plain_request(1, 10)).unwrap();
        assert!(rw.sql.contains("\"1.pt\"::text AS \"pt\""));
        assert!(rw.sql.contains("\"0.id\" AS \"id\""));
    }

    #[test]
    fn duplicate_names_stay_distinct() {
        let rw = paginate(
            "SELECT 1 AS x, 2 AS x",
            &cols(&["x", "x"]),
            0,
            &plain_request(1, 10),
        )
        .unwrap();
        assert!(rw.sql.contains("\"0.x\""));
        assert!(rw.sql.contains("\"1.x\""));
    }

    #[test]
    fn quotes_in_names_are_escaped() {
        let rw = paginate(
            "SELECT 1 AS \"a\"\"b\"",
            &cols(&["a\"b"]),
            0,
            &plain_request(1, 10),
        )
        .unwrap();
        assert!(rw.sql.contains("\"0.a\"\"b\""));
    }

    #[test]
    fn rejects_bad_pagination() {
        assert!(paginate("SELECT 1", &cols(&["x"]), 0, &plain_request(0, 10)).is_err());
        assert!(paginate("SELECT 1", &cols(&["x"]), 0, &plain_request(1, 0)).is_err());
        assert!(paginate("SELECT 1", &cols(&["x"]), 0, &plain_request(1, -2)).is_err());
    }

    #[test]
    fn rejects_out_of_range_sort() {
        let mut req = plain_request(1, 10);
        req.sort = Some(Sort {
            column_idx: 5,
            direction: SortDirection::Asc,
        });
        assert!(paginate("SELECT 1", &cols(&["x"]), 0, &req).is_err());
    }

    #[test]
    fn bare_explain_is_upgraded_to_json() {
        let form = explain_form("EXPLAIN SELECT 1").unwrap();
        assert_eq!(form.sql, "EXPLAIN (FORMAT JSON, ANALYZE false) SELECT 1");
        assert_eq!(form.inner, "SELECT 1");
        assert!(form.json_format);
    }

    #[test]
    fn explain_analyze_passes_through_verbatim() {
        let form = explain_form("EXPLAIN ANALYZE SELECT * FROM t").unwrap();
        assert_eq!(form.sql, "EXPLAIN ANALYZE SELECT * FROM t");
        assert_eq!(form.inner, "SELECT * FROM t");
        assert!(!form.json_format);
    }

    #[test]
    fn explain_with_options_passes_through_verbatim() {
        let form = explain_form("explain (buffers, analyze) SELECT 1").unwrap();
        assert_eq!(form.sql, "explain (buffers, analyze) SELECT 1");
        assert_eq!(form.inner, "SELECT 1");
        assert!(!form.json_format);
    }

    #[test]
    fn explain_behind_comments_is_still_recognised() {
        let form = explain_form("/* check the plan */ -- please\nEXPLAIN SELECT 1").unwrap();
        assert_eq!(form.inner, "SELECT 1");
        assert!(form.json_format);
    }
}
