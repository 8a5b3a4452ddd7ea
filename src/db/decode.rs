//! Row decoding and parameter encoding.
//!
//! Cells become canonical JSON scalars where a native representation exists:
//! booleans, integers, floats, `numeric` as a string (arbitrary precision),
//! timestamps as ISO-8601 strings, `uuid` as its text form, `bytea` as
//! base64, json/jsonb and one-dimensional arrays as nested JSON. Columns of
//! any other type are projected as `::text` by the rewriter, so their cells
//! arrive here as plain strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Column, Row};
use uuid::Uuid;

use crate::db::types::{FilterValueType, ResultColumn};
use crate::error::{Error, Result};

/// A parameter value boxed for the driver.
pub type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Borrow boxed params in the form the driver wants.
pub fn dyn_params(params: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref() as _).collect()
}

/// Whether the decoder has a native JSON representation for the type. The
/// rewriter degrades everything else to `::text`.
pub fn type_supported(ty: &Type) -> bool {
    matches!(
        ty.name(),
        "bool"
            | "int2"
            | "int4"
            | "int8"
            | "oid"
            | "float4"
            | "float8"
            | "numeric"
            | "text"
            | "varchar"
            | "bpchar"
            | "name"
            | "citext"
            | "json"
            | "jsonb"
            | "date"
            | "time"
            | "timestamp"
            | "timestamptz"
            | "uuid"
            | "bytea"
            | "_bool"
            | "_int2"
            | "_int4"
            | "_int8"
            | "_float4"
            | "_float8"
            | "_numeric"
            | "_text"
            | "_varchar"
            | "_uuid"
    )
}

/// Column metadata as reported to clients, provenance not yet attached.
pub fn column_meta(idx: usize, col: &Column) -> ResultColumn {
    ResultColumn {
        table_oid: col.table_oid(),
        column_id: col.column_id(),
        name: col.name().to_owned(),
        index: idx,
        type_name: col.type_().name().to_owned(),
        origin: None,
    }
}

fn opt<T: Into<Value>>(v: Option<T>) -> Value {
    v.map(Into::into).unwrap_or(Value::Null)
}

fn array<T>(v: Option<Vec<Option<T>>>, f: impl Fn(T) -> Value) -> Value {
    match v {
        Some(items) => Value::Array(
            items
                .into_iter()
                .map(|item| item.map(&f).unwrap_or(Value::Null))
                .collect(),
        ),
        None => Value::Null,
    }
}

/// Decode one cell to JSON. Decoding failures degrade to `null` rather than
/// failing the whole page.
pub fn cell_to_json(row: &Row, idx: usize, ty: &Type) -> Value {
    match ty.name() {
        "bool" => opt(row.try_get::<_, Option<bool>>(idx).unwrap_or(None)),
        "int2" => opt(row.try_get::<_, Option<i16>>(idx).unwrap_or(None)),
        "int4" => opt(row.try_get::<_, Option<i32>>(idx).unwrap_or(None)),
        "int8" => opt(row.try_get::<_, Option<i64>>(idx).unwrap_or(None)),
        "oid" => opt(row.try_get::<_, Option<u32>>(idx).unwrap_or(None)),
        "float4" => opt(row.try_get::<_, Option<f32>>(idx).unwrap_or(None)),
        "float8" => opt(row.try_get::<_, Option<f64>>(idx).unwrap_or(None)),
        // arbitrary precision survives as a string
        "numeric" => opt(
            row.try_get::<_, Option<Decimal>>(idx)
                .unwrap_or(None)
                .map(|d| d.to_string()),
        ),
        "text" | "varchar" | "bpchar" | "name" | "citext" => {
            opt(row.try_get::<_, Option<String>>(idx).unwrap_or(None))
        }
        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)
            .unwrap_or(None)
            .unwrap_or(Value::Null),
        "date" => opt(
            row.try_get::<_, Option<NaiveDate>>(idx)
                .unwrap_or(None)
                .map(|d| d.format("%Y-%m-%d").to_string()),
        ),
        "time" => opt(
            row.try_get::<_, Option<NaiveTime>>(idx)
                .unwrap_or(None)
                .map(|t| t.format("%H:%M:%S%.f").to_string()),
        ),
        "timestamp" => opt(
            row.try_get::<_, Option<NaiveDateTime>>(idx)
                .unwrap_or(None)
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        ),
        "timestamptz" => opt(
            row.try_get::<_, Option<DateTime<Utc>>>(idx)
                .unwrap_or(None)
                .map(|t| t.to_rfc3339()),
        ),
        "uuid" => opt(
            row.try_get::<_, Option<Uuid>>(idx)
                .unwrap_or(None)
                .map(|u| u.to_string()),
        ),
        "bytea" => opt(
            row.try_get::<_, Option<Vec<u8>>>(idx)
                .unwrap_or(None)
                .map(|b| BASE64.encode(b)),
        ),
        "_bool" => array(row.try_get::<_, Option<Vec<Option<bool>>>>(idx).unwrap_or(None), Value::from),
        "_int2" => array(row.try_get::<_, Option<Vec<Option<i16>>>>(idx).unwrap_or(None), Value::from),
        "_int4" => array(row.try_get::<_, Option<Vec<Option<i32>>>>(idx).unwrap_or(None), Value::from),
        "_int8" => array(row.try_get::<_, Option<Vec<Option<i64>>>>(idx).unwrap_or(None), Value::from),
        "_float4" => array(row.try_get::<_, Option<Vec<Option<f32>>>>(idx).unwrap_or(None), Value::from),
        "_float8" => array(row.try_get::<_, Option<Vec<Option<f64>>>>(idx).unwrap_or(None), Value::from),
        "_numeric" => array(
            row.try_get::<_, Option<Vec<Option<Decimal>>>>(idx).unwrap_or(None),
            |d| Value::from(d.to_string()),
        ),
        "_text" | "_varchar" => {
            array(row.try_get::<_, Option<Vec<Option<String>>>>(idx).unwrap_or(None), Value::from)
        }
        "_uuid" => array(
            row.try_get::<_, Option<Vec<Option<Uuid>>>>(idx).unwrap_or(None),
            |u| Value::from(u.to_string()),
        ),
        other => {
            // the rewriter should have degraded this column to text already
            tracing::warn!("unsupported column type {other}, rendering null");
            Value::Null
        }
    }
}

/// Decode a full row against the statement's columns.
pub fn row_to_json(row: &Row, columns: &[Column], skip: usize) -> Vec<Value> {
    columns
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(idx, col)| cell_to_json(row, idx, col.type_()))
        .collect()
}

/// Convert a JSON request parameter to a driver value of the probed type.
/// Unknown types coerce from the value's text form and rely on the server
/// to parse it.
pub fn json_to_param(value: &Value, ty: &Type) -> Result<BoxedParam> {
    if value.is_null() {
        return Ok(null_param(ty));
    }
    match ty.name() {
        "bool" => Ok(Box::new(expect_bool(value, ty)?)),
        "int2" => {
            let n = expect_i64(value, ty)?;
            let n = i16::try_from(n).map_err(|_| out_of_range(ty, value))?;
            Ok(Box::new(n))
        }
        "int4" => {
            let n = expect_i64(value, ty)?;
            let n = i32::try_from(n).map_err(|_| out_of_range(ty, value))?;
            Ok(Box::new(n))
        }
        "int8" => Ok(Box::new(expect_i64(value, ty)?)),
        "float4" => Ok(Box::new(expect_f64(value, ty)? as f32)),
        "float8" => Ok(Box::new(expect_f64(value, ty)?)),
        "numeric" => Ok(Box::new(parse_decimal(value, ty)?)),
        "text" | "varchar" | "bpchar" | "name" | "citext" => Ok(Box::new(coerce_text(value))),
        "json" | "jsonb" => Ok(Box::new(value.clone())),
        "date" => Ok(Box::new(parse_date(expect_str(value, ty)?)?)),
        "time" => {
            let s = expect_str(value, ty)?;
            let t = NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .map_err(|_| parse_failed(ty, s))?;
            Ok(Box::new(t))
        }
        "timestamp" => Ok(Box::new(parse_timestamp(expect_str(value, ty)?)?)),
        "timestamptz" => {
            let s = expect_str(value, ty)?;
            let t = DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| parse_failed(ty, s))?;
            Ok(Box::new(t))
        }
        "uuid" => {
            let s = expect_str(value, ty)?;
            Ok(Box::new(Uuid::parse_str(s).map_err(|_| parse_failed(ty, s))?))
        }
        _ => Ok(Box::new(coerce_text(value))),
    }
}

/// Convert a filter value per its declared type. Filter placeholders carry
/// an explicit SQL cast, so these bindings are always typed exactly.
pub fn filter_to_param(
    value: &Value,
    value_type: FilterValueType,
    wrap_like: bool,
) -> Result<BoxedParam> {
    match value_type {
        FilterValueType::Boolean => {
            let b = value
                .as_bool()
                .ok_or_else(|| Error::bad_request("filter expects a boolean value"))?;
            Ok(Box::new(b))
        }
        FilterValueType::Integer => {
            let n = value
                .as_i64()
                .ok_or_else(|| Error::bad_request("filter expects an integer value"))?;
            Ok(Box::new(n))
        }
        FilterValueType::Numeric => {
            let d = parse_decimal(value, &Type::NUMERIC)?;
            Ok(Box::new(d))
        }
        FilterValueType::Text => {
            let text = coerce_text(value);
            if wrap_like {
                Ok(Box::new(format!("%{text}%")))
            } else {
                Ok(Box::new(text))
            }
        }
        FilterValueType::Timestamp => {
            let s = value
                .as_str()
                .ok_or_else(|| Error::bad_request("filter expects a timestamp string"))?;
            Ok(Box::new(parse_timestamp(s)?))
        }
    }
}

/// A NULL binding typed to match the probed parameter type.
fn null_param(ty: &Type) -> BoxedParam {
    match ty.name() {
        "bool" => Box::new(Option::<bool>::None),
        "int2" => Box::new(Option::<i16>::None),
        "int4" => Box::new(Option::<i32>::None),
        "int8" => Box::new(Option::<i64>::None),
        "float4" => Box::new(Option::<f32>::None),
        "float8" => Box::new(Option::<f64>::None),
        "numeric" => Box::new(Option::<Decimal>::None),
        "date" => Box::new(Option::<NaiveDate>::None),
        "time" => Box::new(Option::<NaiveTime>::None),
        "timestamp" => Box::new(Option::<NaiveDateTime>::None),
        "timestamptz" => Box::new(Option::<DateTime<Utc>>::None),
        "uuid" => Box::new(Option::<Uuid>::None),
        "json" | "jsonb" => Box::new(Option::<Value>::None),
        _ => Box::new(Option::<String>::None),
    }
}

fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn expect_bool(value: &Value, ty: &Type) -> Result<bool> {
    value.as_bool().ok_or_else(|| type_mismatch(ty, "boolean", value))
}

fn expect_i64(value: &Value, ty: &Type) -> Result<i64> {
    value.as_i64().ok_or_else(|| type_mismatch(ty, "integer", value))
}

fn expect_f64(value: &Value, ty: &Type) -> Result<f64> {
    value.as_f64().ok_or_else(|| type_mismatch(ty, "number", value))
}

fn expect_str<'a>(value: &'a Value, ty: &Type) -> Result<&'a str> {
    value.as_str().ok_or_else(|| type_mismatch(ty, "string", value))
}

fn parse_decimal(value: &Value, ty: &Type) -> Result<Decimal> {
    match value {
        Value::String(s) => s.parse::<Decimal>().map_err(|_| parse_failed(ty, s)),
        Value::Number(_) => {
            let f = value.as_f64().ok_or_else(|| type_mismatch(ty, "number", value))?;
            Decimal::from_f64_retain(f).ok_or_else(|| out_of_range(ty, value))
        }
        _ => Err(type_mismatch(ty, "number or string", value)),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| parse_failed(&Type::DATE, s))
}

/// Accept `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS[.f]` or the space-separated
/// variant.
fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(t);
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(t);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t);
        }
    }
    Err(Error::bad_request(format!(
        "invalid timestamp `{s}`, expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS"
    )))
}

fn type_mismatch(ty: &Type, wanted: &str, got: &Value) -> Error {
    Error::bad_request(format!(
        "parameter of type {} expects a {wanted}, got {got}",
        ty.name()
    ))
}

fn parse_failed(ty: &Type, s: &str) -> Error {
    Error::bad_request(format!("cannot parse `{s}` as {}", ty.name()))
}

fn out_of_range(ty: &Type, value: &Value) -> Error {
    Error::bad_request(format!("{value} is out of range for {}", ty.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_types_include_arrays_and_exclude_exotics() {
        assert!(type_supported(&Type::INT4));
        assert!(type_supported(&Type::NUMERIC));
        assert!(type_supported(&Type::INT8_ARRAY));
        assert!(type_supported(&Type::TEXT_ARRAY));
        assert!(!type_supported(&Type::POINT));
        assert!(!type_supported(&Type::INTERVAL));
    }

    #[test]
    fn params_convert_by_probed_type() {
        let p = json_to_param(&serde_json::json!(7), &Type::INT4);
        assert!(p.is_ok());
        let p = json_to_param(&serde_json::json!("not a number"), &Type::INT4);
        assert!(p.is_err());
        let p = json_to_param(&serde_json::json!("12.50"), &Type::NUMERIC);
        assert!(p.is_ok());
        let p = json_to_param(&serde_json::json!(true), &Type::BOOL);
        assert!(p.is_ok());
        // null binds as NULL regardless of type
        assert!(json_to_param(&Value::Null, &Type::INT8).is_ok());
    }

    #[test]
    fn int_params_respect_range() {
        assert!(json_to_param(&serde_json::json!(40000), &Type::INT2).is_err());
        assert!(json_to_param(&serde_json::json!(40000), &Type::INT4).is_ok());
    }

    #[test]
    fn timestamp_params_accept_date_only() {
        assert!(json_to_param(&serde_json::json!("2024-03-01"), &Type::TIMESTAMP).is_ok());
        assert!(
            json_to_param(&serde_json::json!("2024-03-01 10:30:00"), &Type::TIMESTAMP).is_ok()
        );
        assert!(json_to_param(&serde_json::json!("yesterday"), &Type::TIMESTAMP).is_err());
    }

    #[test]
    fn like_filters_wrap_the_pattern() {
        let p = filter_to_param(&serde_json::json!("abc"), FilterValueType::Text, true);
        assert!(p.is_ok());
        // the wrapped pattern is observable through ToSql's Debug
        let boxed = p.unwrap();
        assert!(format!("{boxed:?}").contains("%abc%"));
    }

    #[test]
    fn filter_type_mismatch_is_bad_request() {
        let p = filter_to_param(&serde_json::json!("x"), FilterValueType::Integer, false);
        assert!(matches!(p, Err(Error::BadRequest { .. })));
    }
}
