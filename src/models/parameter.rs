// Typed parameter values and coercion of raw request values
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::api::middleware::AppError;
use crate::models::{ParameterConfig, ParameterType, QueryConfig};

/// Raw parameter values already extracted by the HTTP layer
pub type ParameterBag = HashMap<String, Value>;

/// A parameter value coerced to its declared type
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Null,
    Text(String),
    Integer(i32),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

impl BoundValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BoundValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BoundValue::Integer(v) => Some(i64::from(*v)),
            BoundValue::Long(v) => Some(*v),
            BoundValue::Boolean(v) => Some(i64::from(*v)),
            BoundValue::Double(v) if v.fract() == 0.0 => Some(*v as i64),
            BoundValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BoundValue::Integer(v) => Some(f64::from(*v)),
            BoundValue::Long(v) => Some(*v as f64),
            BoundValue::Double(v) => Some(*v),
            BoundValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BoundValue::Boolean(v) => Some(*v),
            BoundValue::Integer(v) => Some(*v != 0),
            BoundValue::Long(v) => Some(*v != 0),
            BoundValue::Text(s) => parse_bool(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            BoundValue::Date(d) => Some(*d),
            BoundValue::Timestamp(ts) => Some(ts.date()),
            BoundValue::Text(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            BoundValue::Timestamp(ts) => Some(*ts),
            BoundValue::Date(d) => d.and_hms_opt(0, 0, 0),
            BoundValue::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Textual form used in SQL text parameters and cache keys
    pub fn to_text(&self) -> Option<String> {
        match self {
            BoundValue::Null => None,
            BoundValue::Text(s) => Some(s.clone()),
            BoundValue::Integer(v) => Some(v.to_string()),
            BoundValue::Long(v) => Some(v.to_string()),
            BoundValue::Double(v) => Some(v.to_string()),
            BoundValue::Boolean(v) => Some(v.to_string()),
            BoundValue::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
            BoundValue::Timestamp(ts) => Some(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        }
    }
}

impl fmt::Display for BoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Coerce a raw JSON value to the declared parameter type
pub fn coerce_value(param: &ParameterConfig, raw: &Value) -> Result<BoundValue, AppError> {
    let fail = |reason: &str| AppError::ParameterCoercion {
        parameter: param.name.clone(),
        expected: param.param_type.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_null() {
        return Ok(BoundValue::Null);
    }

    match param.param_type {
        ParameterType::String => match raw {
            Value::String(s) => Ok(BoundValue::Text(s.clone())),
            Value::Number(n) => Ok(BoundValue::Text(n.to_string())),
            Value::Bool(b) => Ok(BoundValue::Text(b.to_string())),
            _ => Err(fail("got a structured value")),
        },
        ParameterType::Integer => {
            let value = integer_of(raw).ok_or_else(|| fail("got a non-integer value"))?;
            i32::try_from(value)
                .map(BoundValue::Integer)
                .map_err(|_| fail("value is out of range for a 32-bit integer"))
        }
        ParameterType::Long => integer_of(raw)
            .map(BoundValue::Long)
            .ok_or_else(|| fail("got a non-integer value")),
        ParameterType::Double => {
            let value = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            value
                .filter(|v| v.is_finite())
                .map(BoundValue::Double)
                .ok_or_else(|| fail("got a non-numeric value"))
        }
        ParameterType::Boolean => match raw {
            Value::Bool(b) => Ok(BoundValue::Boolean(*b)),
            Value::String(s) => parse_bool(s)
                .map(BoundValue::Boolean)
                .ok_or_else(|| fail("got a non-boolean value")),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(BoundValue::Boolean(false)),
                Some(1) => Ok(BoundValue::Boolean(true)),
                _ => Err(fail("only 0 and 1 are accepted as numeric booleans")),
            },
            _ => Err(fail("got a non-boolean value")),
        },
        ParameterType::Date => raw
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok())
            .map(BoundValue::Date)
            .ok_or_else(|| fail("dates must use the YYYY-MM-DD format")),
        ParameterType::Timestamp => raw
            .as_str()
            .and_then(parse_timestamp)
            .map(BoundValue::Timestamp)
            .ok_or_else(|| fail("timestamps must be ISO-8601")),
    }
}

fn integer_of(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Bind a parameter bag to the declared parameters of a query, in declared order.
///
/// Missing required parameters without a default are rejected; missing optional
/// parameters fall back to their default or to NULL. Undeclared entries are ignored.
pub fn bind_parameters(query: &QueryConfig, bag: &ParameterBag) -> Result<Vec<(String, BoundValue)>, AppError> {
    let mut bound = Vec::with_capacity(query.parameters.len());

    for param in &query.parameters {
        let supplied = bag.get(&param.name).filter(|v| !is_blank(v));
        let value = match (supplied, &param.default_value) {
            (Some(raw), _) => coerce_value(param, raw)?,
            (None, Some(default)) => coerce_value(param, default)?,
            (None, None) if param.required => {
                return Err(AppError::Validation(format!(
                    "Missing required parameter '{}'",
                    param.name
                )));
            }
            (None, None) => BoundValue::Null,
        };
        bound.push((param.name.clone(), value));
    }

    Ok(bound)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
