//! Wire-level data model for query responses.
//!
//! Everything here serializes straight into HTTP bodies; the row cell model
//! is plain `serde_json::Value` so a page is encoded exactly once.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sort order requested for a paginated select.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sort {
    /// Index into the result's `columns` array.
    pub column_idx: usize,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortDirection {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

impl std::fmt::Display for SortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// A column filter applied on top of a select's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    /// Declared type of the filtered column; drives value coercion.
    #[serde(rename = "type")]
    pub value_type: FilterValueType,
    /// Index of the filtered column in the result's `columns` array.
    pub index: usize,
    /// Name of the filtered column (display name; the index disambiguates
    /// duplicates).
    pub column: String,
    pub operator: FilterOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterValueType {
    Boolean,
    Integer,
    Numeric,
    Text,
    Timestamp,
}

impl FilterValueType {
    /// SQL cast applied to the filter's placeholder so the server never has
    /// to guess the parameter type.
    pub fn sql_cast(self) -> &'static str {
        match self {
            FilterValueType::Boolean => "bool",
            FilterValueType::Integer => "int8",
            FilterValueType::Numeric => "numeric",
            FilterValueType::Text => "text",
            FilterValueType::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Like,
    NotLike,
    Null,
    NotNull,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub fn sql_op(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Neq => "!=",
            FilterOp::Like => "ILIKE",
            FilterOp::NotLike => "NOT ILIKE",
            FilterOp::Null => "IS NULL",
            FilterOp::NotNull => "IS NOT NULL",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
        }
    }

    /// Whether the operator binds a value. `IS NULL` / `IS NOT NULL` do not.
    pub fn binds_value(self) -> bool {
        !matches!(self, FilterOp::Null | FilterOp::NotNull)
    }
}

impl Filter {
    /// Validate the filter against the statement's output columns.
    pub fn validate(&self, column_count: usize) -> Result<(), Error> {
        if self.index >= column_count {
            return Err(Error::BadRequest {
                message: format!(
                    "filter index {} out of range ({} columns)",
                    self.index, column_count
                ),
                field: Some("filters".into()),
            });
        }
        if self.operator.binds_value() && self.value.is_null() {
            return Err(Error::BadRequest {
                message: format!("filter on `{}` requires a value", self.column),
                field: Some("filters".into()),
            });
        }
        Ok(())
    }
}

/// One output column of an executed statement, with catalog provenance when
/// the annotator could resolve it.
#[derive(Debug, Clone, Serialize)]
pub struct ResultColumn {
    #[serde(skip_serializing)]
    pub table_oid: Option<u32>,
    #[serde(skip_serializing)]
    pub column_id: Option<i16>,

    pub name: String,
    pub index: usize,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(flatten)]
    pub origin: Option<ColumnOrigin>,
}

/// Source-table and foreign-key provenance of a result column.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ColumnOrigin {
    pub source_table: Option<String>,
    pub source_column: Option<String>,
    pub fk_constraint: Option<String>,
    pub fk_table: Option<String>,
    pub fk_column: Option<String>,
}

/// Columns plus row data of one page.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<ResultColumn>,
    /// Row cells aligned with `columns`. Scalars, nulls, arrays and objects.
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// The polymorphic result of `POST /query`, externally tagged with `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResultPage {
    Select {
        /// 1-indexed page number.
        page: usize,
        /// Rows per page; -1 means everything in one page.
        page_size: i64,
        /// Rows in this page.
        page_count: usize,
        /// Rows across all pages (after filtering).
        total_count: usize,
        total_pages: usize,
        sort: Option<Sort>,
        entries: QueryResult,
    },

    ModifyData {
        affected_rows: u64,
    },

    ModifyStructure,

    Explain {
        /// The statement the plan belongs to.
        query: String,
        /// The execution plan, JSON or text depending on the EXPLAIN form.
        plan: String,
    },
}
