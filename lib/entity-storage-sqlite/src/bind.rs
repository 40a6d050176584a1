//! Conversion between engine values and SQLite arguments and rows.

use entity_storage::{Row, StorageError, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Arguments, Column, Row as _, TypeInfo, ValueRef};

/// Bind positional parameters in order.
pub(crate) fn bind_values<'q>(params: &[Value]) -> Result<SqliteArguments<'q>, StorageError> {
    let mut args = SqliteArguments::default();
    for value in params {
        bind_value(&mut args, value)?;
    }
    Ok(args)
}

fn bind_value(args: &mut SqliteArguments<'_>, value: &Value) -> Result<(), StorageError> {
    match value {
        Value::Null => args.add(None::<String>),
        Value::Text(s) => args.add(s.clone()),
        Value::Integer(n) => args.add(*n),
        Value::Real(n) => args.add(*n),
        Value::Bool(b) => args.add(*b),
        Value::Blob(bytes) => args.add(bytes.clone()),
    }
    .map_err(StorageError::engine)
}

/// Read every column of a row by its runtime storage class.
pub(crate) fn extract_row(row: &SqliteRow) -> Result<Row, StorageError> {
    let mut values = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        values.insert(column.name().to_string(), extract_value(row, idx)?);
    }
    Ok(values)
}

fn extract_value(row: &SqliteRow, idx: usize) -> Result<Value, StorageError> {
    let raw = row.try_get_raw(idx).map_err(StorageError::engine)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let value = match raw.type_info().name() {
        "INTEGER" | "BOOLEAN" => Value::Integer(
            row.try_get_unchecked::<i64, _>(idx)
                .map_err(StorageError::engine)?,
        ),
        "REAL" => Value::Real(
            row.try_get_unchecked::<f64, _>(idx)
                .map_err(StorageError::engine)?,
        ),
        "BLOB" => Value::Blob(
            row.try_get_unchecked::<Vec<u8>, _>(idx)
                .map_err(StorageError::engine)?,
        ),
        _ => Value::Text(
            row.try_get_unchecked::<String, _>(idx)
                .map_err(StorageError::engine)?,
        ),
    };
    Ok(value)
}
