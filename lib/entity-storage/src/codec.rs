//! Conversion between entity field values and statement values.
//!
//! Fields are held as `serde_json::Value`; only [`Value`] crosses into a
//! prepared statement. Decoding is driven by each column's storage and logical
//! type, never by inspecting the row at hand.
//!
//! A JSON `null` is never written as the text `null`: every column, `json`
//! ones included, binds it as SQL `NULL`. Reading that `NULL` back leaves the
//! field unset unless the column's storage default is
//! [`StorageDefault::Null`], so a `json` column declared with
//! `storage_default_null()` is the way to round-trip an explicit `null`.

use std::collections::BTreeMap;

use serde::ser::Error as _;
use serde_json::Value as JsonValue;

use crate::schema::{ColumnMetadata, ColumnType, EntitySchema, LogicalType, StorageDefault};
use crate::{Row, StorageDatetime, StorageError, Value};

/// Bidirectional conversion for a column with a custom storage form.
///
/// Takes precedence over the column's built-in JSON, boolean and datetime
/// handling in both directions.
pub trait ValueTransformer: Send + Sync {
    fn to_store(&self, value: &JsonValue) -> Result<Value, StorageError>;

    fn from_store(&self, value: &Value) -> Result<JsonValue, StorageError>;
}

fn mismatch(column: &ColumnMetadata, value: &JsonValue) -> StorageError {
    StorageError::SerializationError(serde_json::Error::custom(format!(
        "column {} ({:?}/{:?}) cannot store {}",
        column.name(),
        column.column_type(),
        column.logical_type(),
        value
    )))
}

/// Encode a field value for binding.
pub fn encode_field(column: &ColumnMetadata, value: &JsonValue) -> Result<Value, StorageError> {
    if let Some(transformer) = column.get_transformer() {
        return transformer.to_store(value);
    }
    if value.is_null() {
        return Ok(Value::Null);
    }

    match column.logical_type() {
        LogicalType::Boolean => match value {
            JsonValue::Bool(b) => Ok(Value::Integer(i64::from(*b))),
            JsonValue::Number(n) => n
                .as_i64()
                .map(|n| Value::Integer(i64::from(n != 0)))
                .ok_or_else(|| mismatch(column, value)),
            _ => Err(mismatch(column, value)),
        },
        LogicalType::Datetime => encode_datetime(column, value),
        LogicalType::Plain => match column.column_type() {
            ColumnType::Json => Ok(Value::Text(serde_json::to_string(value)?)),
            ColumnType::Blob => encode_bytes(column, value),
            ColumnType::Real => match value {
                JsonValue::Number(n) => n
                    .as_f64()
                    .map(Value::Real)
                    .ok_or_else(|| mismatch(column, value)),
                _ => scalar(column, value),
            },
            ColumnType::Text | ColumnType::Integer => scalar(column, value),
        },
    }
}

fn scalar(column: &ColumnMetadata, value: &JsonValue) -> Result<Value, StorageError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Real(f))
            } else {
                Ok(Value::Text(n.to_string()))
            }
        }
        JsonValue::String(s) => Ok(Value::Text(s.clone())),
        JsonValue::Array(_) | JsonValue::Object(_) => Err(mismatch(column, value)),
    }
}

fn encode_bytes(column: &ColumnMetadata, value: &JsonValue) -> Result<Value, StorageError> {
    match value {
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| mismatch(column, value))
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Value::Blob),
        JsonValue::String(s) => Ok(Value::Blob(s.as_bytes().to_vec())),
        _ => Err(mismatch(column, value)),
    }
}

fn encode_datetime(column: &ColumnMetadata, value: &JsonValue) -> Result<Value, StorageError> {
    let datetime = match value {
        JsonValue::String(s) => StorageDatetime::parse_text(s)?,
        JsonValue::Number(_) => return scalar(column, value),
        _ => return Err(mismatch(column, value)),
    };

    Ok(match column.column_type() {
        ColumnType::Integer => Value::Integer(datetime.to_unix_seconds()),
        ColumnType::Real => Value::Real(datetime.to_julian_day()),
        _ => Value::Text(datetime.to_rfc3339()),
    })
}

/// Plain JSON view of a stored value, without any column knowledge.
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Integer(n) => JsonValue::from(*n),
        Value::Real(n) => serde_json::Number::from_f64(*n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Blob(bytes) => JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()),
    }
}

/// Decode a stored value into a field value.
///
/// Returns `None` when the field should stay unset: a stored `NULL` is only
/// applied when the column's storage default is exactly `NULL`.
pub fn decode_field(
    column: &ColumnMetadata,
    stored: &Value,
) -> Result<Option<JsonValue>, StorageError> {
    if stored.is_null() {
        return Ok(match column.get_storage_default() {
            Some(StorageDefault::Null) => Some(JsonValue::Null),
            _ => None,
        });
    }
    if let Some(transformer) = column.get_transformer() {
        return transformer.from_store(stored).map(Some);
    }

    let decoded = match column.logical_type() {
        LogicalType::Boolean => match stored {
            Value::Integer(n) => JsonValue::Bool(*n != 0),
            Value::Bool(b) => JsonValue::Bool(*b),
            other => value_to_json(other),
        },
        LogicalType::Datetime => {
            let datetime = match stored {
                Value::Text(s) => StorageDatetime::parse_text(s)?,
                Value::Integer(n) => StorageDatetime::from_unix_seconds(*n)?,
                Value::Real(day) => StorageDatetime::from_julian_day(*day)?,
                other => return Ok(Some(value_to_json(other))),
            };
            JsonValue::String(datetime.to_rfc3339())
        }
        LogicalType::Plain => match (column.column_type(), stored) {
            (ColumnType::Json, Value::Text(s)) => serde_json::from_str(s)?,
            (ColumnType::Json, Value::Blob(bytes)) => serde_json::from_slice(bytes)?,
            (_, other) => value_to_json(other),
        },
    };

    Ok(Some(decoded))
}

/// Decode every schema column present in `row`; extra row columns are ignored.
pub fn decode_row(
    schema: &EntitySchema,
    row: &Row,
) -> Result<BTreeMap<String, JsonValue>, StorageError> {
    let mut fields = BTreeMap::new();
    for column in schema.columns() {
        let Some(stored) = row.get(column.name()) else {
            continue;
        };
        if let Some(value) = decode_field(column, stored)? {
            fields.insert(column.name().to_string(), value);
        }
    }
    Ok(fields)
}
