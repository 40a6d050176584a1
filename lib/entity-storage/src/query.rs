//! Statement builder for single-table CRUD.
//!
//! Every function here is pure: it turns a table name, column data and
//! equality conditions into parameterized SQL plus the ordered parameter list
//! matching its `?` placeholders. Identical inputs always render identical SQL
//! text, which is what lets the statement cache reuse prepared handles.

use std::collections::BTreeMap;

use crate::StorageError;
use crate::schema::{ColumnMetadata, ColumnType, EntitySchema, GenerationStrategy, StorageDefault};

/// A value that can be bound to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// SQL literal form, used only for DDL defaults.
    fn to_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Integer(n) => n.to_string(),
            Value::Real(n) => n.to_string(),
            Value::Bool(b) => i64::from(*b).to_string(),
            Value::Blob(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
                format!("X'{}'", hex)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Text(s.clone())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Real(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Blob(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Blob(bytes.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A row returned by the store, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Equality conditions joined with `AND`.
///
/// Backed by a sorted map so the rendered SQL does not depend on the order in
/// which conditions were added.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions(BTreeMap<String, Value>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Conditions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl std::fmt::Display for Conditions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(column, value)| format!("{} = {:?}", column, value))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Column data for INSERT and UPDATE, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Data(Vec<(String, Value)>);

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value, replacing an earlier value for the same column.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == column) {
            Some(slot) => slot.1 = value,
            None => self.0.push((column, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter().map(|(c, v)| (c, v))
    }
}

/// Whether a statement may run without any condition.
///
/// Bulk operations must opt in explicitly so an accidentally empty condition
/// set cannot wipe a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Conditional,
    Unconditional,
}

/// SQL text plus the parameters for its positional placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Check that a name is a plain SQL identifier.
pub fn validate_identifier(name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StorageError::precondition(format!(
            "invalid identifier: {:?}",
            name
        )))
    }
}

/// Build a WHERE clause from conditions and append their values to `params`.
fn build_where_clause(
    conditions: &Conditions,
    params: &mut Vec<Value>,
) -> Result<String, StorageError> {
    if conditions.is_empty() {
        return Ok(String::new());
    }

    let mut clauses = Vec::with_capacity(conditions.len());
    for (column, value) in conditions.iter() {
        validate_identifier(column)?;
        clauses.push(format!("{} = ?", column));
        params.push(value.clone());
    }

    Ok(format!(" WHERE {}", clauses.join(" AND ")))
}

/// `SELECT * FROM table [WHERE ...] [LIMIT n]`
pub fn select(
    table: &str,
    conditions: &Conditions,
    limit: Option<u64>,
) -> Result<Statement, StorageError> {
    validate_identifier(table)?;
    let mut params = Vec::new();
    let where_clause = build_where_clause(conditions, &mut params)?;

    let mut sql = format!("SELECT * FROM {}{}", table, where_clause);
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(Statement { sql, params })
}

/// `INSERT INTO table (cols) VALUES (?, ...)`
pub fn insert(table: &str, data: &Data) -> Result<Statement, StorageError> {
    validate_identifier(table)?;
    if data.is_empty() {
        return Ok(Statement {
            sql: format!("INSERT INTO {} DEFAULT VALUES", table),
            params: Vec::new(),
        });
    }

    let mut columns = Vec::with_capacity(data.len());
    let mut params = Vec::with_capacity(data.len());
    for (column, value) in data.iter() {
        validate_identifier(column)?;
        columns.push(column.as_str());
        params.push(value.clone());
    }
    let placeholders = vec!["?"; columns.len()].join(", ");

    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        ),
        params,
    })
}

/// `UPDATE table SET col = ?, ... [WHERE ...]`
pub fn update(
    table: &str,
    data: &Data,
    conditions: &Conditions,
    scope: Scope,
) -> Result<Statement, StorageError> {
    validate_identifier(table)?;
    if data.is_empty() {
        return Err(StorageError::precondition(format!(
            "update on {} has no columns to set",
            table
        )));
    }
    require_scope(table, "update", conditions, scope)?;

    let mut assignments = Vec::with_capacity(data.len());
    let mut params = Vec::with_capacity(data.len() + conditions.len());
    for (column, value) in data.iter() {
        validate_identifier(column)?;
        assignments.push(format!("{} = ?", column));
        params.push(value.clone());
    }
    let where_clause = build_where_clause(conditions, &mut params)?;

    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {}{}",
            table,
            assignments.join(", "),
            where_clause
        ),
        params,
    })
}

/// `DELETE FROM table [WHERE ...]`
pub fn delete(
    table: &str,
    conditions: &Conditions,
    scope: Scope,
) -> Result<Statement, StorageError> {
    validate_identifier(table)?;
    require_scope(table, "delete", conditions, scope)?;

    let mut params = Vec::new();
    let where_clause = build_where_clause(conditions, &mut params)?;

    Ok(Statement {
        sql: format!("DELETE FROM {}{}", table, where_clause),
        params,
    })
}

/// `SELECT COUNT(*) AS count FROM table [WHERE ...]`
pub fn count(table: &str, conditions: &Conditions) -> Result<Statement, StorageError> {
    validate_identifier(table)?;
    let mut params = Vec::new();
    let where_clause = build_where_clause(conditions, &mut params)?;

    Ok(Statement {
        sql: format!("SELECT COUNT(*) AS count FROM {}{}", table, where_clause),
        params,
    })
}

/// `SELECT 1 AS present FROM table [WHERE ...] LIMIT 1`
pub fn exists(table: &str, conditions: &Conditions) -> Result<Statement, StorageError> {
    validate_identifier(table)?;
    let mut params = Vec::new();
    let where_clause = build_where_clause(conditions, &mut params)?;

    Ok(Statement {
        sql: format!("SELECT 1 AS present FROM {}{} LIMIT 1", table, where_clause),
        params,
    })
}

fn require_scope(
    table: &str,
    operation: &str,
    conditions: &Conditions,
    scope: Scope,
) -> Result<(), StorageError> {
    if conditions.is_empty() && scope != Scope::Unconditional {
        return Err(StorageError::precondition(format!(
            "{} on {} without conditions requires an unconditional scope",
            operation, table
        )));
    }
    Ok(())
}

/// `CREATE TABLE IF NOT EXISTS` for a registered schema.
pub fn create_table(schema: &EntitySchema) -> Result<String, StorageError> {
    validate_identifier(schema.table())?;
    let primary: Vec<&ColumnMetadata> = schema.primary_columns().collect();
    let inline_primary = primary.len() == 1;

    let mut definitions = Vec::with_capacity(schema.columns().len() + 1);
    for column in schema.columns() {
        validate_identifier(column.name())?;
        definitions.push(column_definition(column, inline_primary));
    }
    if primary.len() > 1 {
        let names: Vec<&str> = primary.iter().map(|c| c.name()).collect();
        definitions.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        schema.table(),
        definitions.join(", ")
    ))
}

fn column_definition(column: &ColumnMetadata, inline_primary: bool) -> String {
    let storage = match column.column_type() {
        ColumnType::Text | ColumnType::Json => "TEXT",
        ColumnType::Integer => "INTEGER",
        ColumnType::Real => "REAL",
        ColumnType::Blob => "BLOB",
    };

    let mut definition = format!("{} {}", column.name(), storage);
    if column.is_primary() && inline_primary {
        definition.push_str(" PRIMARY KEY");
        if column.generation() == GenerationStrategy::Increment {
            definition.push_str(" AUTOINCREMENT");
        }
    }
    if !column.is_nullable() {
        definition.push_str(" NOT NULL");
    }
    if column.is_unique() {
        definition.push_str(" UNIQUE");
    }
    match column.get_storage_default() {
        Some(StorageDefault::Null) => definition.push_str(" DEFAULT NULL"),
        Some(StorageDefault::Value(value)) => {
            definition.push_str(&format!(" DEFAULT {}", value.to_literal()))
        }
        Some(StorageDefault::Expression(expr)) => {
            definition.push_str(&format!(" DEFAULT ({})", expr))
        }
        None => {}
    }
    definition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnMetadata;

    #[test]
    fn select_renders_conditions_in_stable_order() {
        let a = Conditions::new().eq("name", "Ada").eq("email", "ada@x.io");
        let b = Conditions::new().eq("email", "ada@x.io").eq("name", "Ada");

        let first = select("users", &a, None).unwrap();
        let second = select("users", &b, None).unwrap();

        assert_eq!(first.sql, "SELECT * FROM users WHERE email = ? AND name = ?");
        assert_eq!(first, second);
        assert_eq!(
            first.params,
            vec![Value::from("ada@x.io"), Value::from("Ada")]
        );
    }

    #[test]
    fn select_without_conditions_with_limit() {
        let stmt = select("users", &Conditions::new(), Some(1)).unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM users LIMIT 1");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn insert_uses_only_present_columns() {
        let data = Data::new().set("name", "Ada").set("age", 36i64);
        let stmt = insert("users", &data).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO users (name, age) VALUES (?, ?)");
        assert_eq!(stmt.params, vec![Value::from("Ada"), Value::Integer(36)]);
    }

    #[test]
    fn insert_with_no_data_uses_default_values() {
        let stmt = insert("counters", &Data::new()).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO counters DEFAULT VALUES");
    }

    #[test]
    fn data_set_replaces_existing_column() {
        let data = Data::new().set("name", "Ada").set("name", "Grace");
        assert_eq!(data.len(), 1);
        assert_eq!(data.iter().next().map(|(_, v)| v.clone()), Some(Value::from("Grace")));
    }

    #[test]
    fn update_orders_params_data_then_conditions() {
        let data = Data::new().set("name", "Grace");
        let conditions = Conditions::new().eq("id", 7i64);
        let stmt = update("users", &data, &conditions, Scope::Conditional).unwrap();
        assert_eq!(stmt.sql, "UPDATE users SET name = ? WHERE id = ?");
        assert_eq!(stmt.params, vec![Value::from("Grace"), Value::Integer(7)]);
    }

    #[test]
    fn unconditional_statements_require_explicit_scope() {
        let data = Data::new().set("active", false);
        let none = Conditions::new();

        assert!(matches!(
            delete("users", &none, Scope::Conditional),
            Err(StorageError::PreconditionViolated(_))
        ));
        assert!(matches!(
            update("users", &data, &none, Scope::Conditional),
            Err(StorageError::PreconditionViolated(_))
        ));

        let stmt = delete("users", &none, Scope::Unconditional).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM users");
        let stmt = update("users", &data, &none, Scope::Unconditional).unwrap();
        assert_eq!(stmt.sql, "UPDATE users SET active = ?");
    }

    #[test]
    fn update_without_data_is_rejected() {
        let conditions = Conditions::new().eq("id", 1i64);
        assert!(update("users", &Data::new(), &conditions, Scope::Conditional).is_err());
    }

    #[test]
    fn count_selects_a_count_column() {
        let stmt = count("users", &Conditions::new().eq("active", true)).unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) AS count FROM users WHERE active = ?");
        assert_eq!(stmt.params, vec![Value::Bool(true)]);
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(select("users; DROP TABLE users", &Conditions::new(), None).is_err());
        let conditions = Conditions::new().eq("name = name OR 1", 1i64);
        assert!(select("users", &conditions, None).is_err());
        assert!(validate_identifier("_private1").is_ok());
        assert!(validate_identifier("1st").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn create_table_renders_columns_and_defaults() {
        let schema = EntitySchema::builder("User", "users")
            .column(ColumnMetadata::integer("id").primary().increment())
            .column(ColumnMetadata::text("email").unique())
            .column(ColumnMetadata::boolean("active").storage_default(Value::Bool(true)))
            .column(
                ColumnMetadata::datetime("created_at")
                    .storage_default_expression("CURRENT_TIMESTAMP"),
            )
            .column(ColumnMetadata::json("tags").nullable())
            .build()
            .unwrap();

        let ddl = create_table(&schema).unwrap();
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS users (\
             id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, \
             email TEXT NOT NULL UNIQUE, \
             active INTEGER NOT NULL DEFAULT 1, \
             created_at TEXT NOT NULL DEFAULT (CURRENT_TIMESTAMP), \
             tags TEXT)"
        );
    }

    #[test]
    fn create_table_with_composite_key() {
        let schema = EntitySchema::builder("Membership", "memberships")
            .column(ColumnMetadata::integer("user_id").primary())
            .column(ColumnMetadata::integer("group_id").primary())
            .column(ColumnMetadata::text("role").storage_default(Value::from("member")))
            .build()
            .unwrap();

        let ddl = create_table(&schema).unwrap();
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS memberships (\
             user_id INTEGER NOT NULL, \
             group_id INTEGER NOT NULL, \
             role TEXT NOT NULL DEFAULT 'member', \
             PRIMARY KEY (user_id, group_id))"
        );
    }
}
