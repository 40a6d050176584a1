//! Entity metadata and the registry that hands it to the engine.
//!
//! Schemas are registered explicitly and returned as `Arc<EntitySchema>`; the
//! lifecycle engine receives them by reference instead of looking them up
//! through ambient state.
//!
//! # Example
//!
//! ```text
//! let registry = SchemaRegistry::new();
//! let users = registry.register(
//!     EntitySchema::builder("User", "users")
//!         .column(ColumnMetadata::integer("id").primary().increment())
//!         .column(ColumnMetadata::text("name"))
//!         .column(ColumnMetadata::boolean("active").storage_default(Value::Bool(true)))
//!         .build()?,
//! )?;
//! registry.initialize();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::StorageError;
use crate::codec::ValueTransformer;
use crate::query::{Value, validate_identifier};

/// Storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Json,
}

/// How a stored value maps onto the field it populates.
///
/// Resolved once at registration so row decoding never has to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicalType {
    #[default]
    Plain,
    Boolean,
    Datetime,
}

/// Rule by which a primary-key value is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationStrategy {
    #[default]
    None,
    Increment,
    Uuid,
}

/// Default supplied by the store itself.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageDefault {
    Null,
    Value(Value),
    /// Raw SQL expression, e.g. `CURRENT_TIMESTAMP`.
    Expression(String),
}

type Producer = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Default computed by the engine before an insert is issued.
#[derive(Clone)]
pub enum DefaultValue {
    Value(serde_json::Value),
    Producer(Producer),
}

impl DefaultValue {
    pub fn resolve(&self) -> serde_json::Value {
        match self {
            DefaultValue::Value(value) => value.clone(),
            DefaultValue::Producer(produce) => produce(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            DefaultValue::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// Static metadata for one column.
#[derive(Clone)]
pub struct ColumnMetadata {
    name: String,
    column_type: ColumnType,
    logical_type: LogicalType,
    nullable: bool,
    unique: bool,
    primary: bool,
    generation: GenerationStrategy,
    default: Option<DefaultValue>,
    storage_default: Option<StorageDefault>,
    transformer: Option<Arc<dyn ValueTransformer>>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            logical_type: LogicalType::Plain,
            nullable: false,
            unique: false,
            primary: false,
            generation: GenerationStrategy::None,
            default: None,
            storage_default: None,
            transformer: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Json)
    }

    /// Boolean field stored as integer 0/1.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer).logical(LogicalType::Boolean)
    }

    /// Datetime field stored as text.
    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text).logical(LogicalType::Datetime)
    }

    pub fn logical(mut self, logical_type: LogicalType) -> Self {
        self.logical_type = logical_type;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn increment(mut self) -> Self {
        self.generation = GenerationStrategy::Increment;
        self
    }

    pub fn uuid(mut self) -> Self {
        self.generation = GenerationStrategy::Uuid;
        self
    }

    pub fn default_value(mut self, value: serde_json::Value) -> Self {
        self.default = Some(DefaultValue::Value(value));
        self
    }

    pub fn default_with<F>(mut self, produce: F) -> Self
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Producer(Arc::new(produce)));
        self
    }

    pub fn storage_default(mut self, value: Value) -> Self {
        self.storage_default = Some(match value {
            Value::Null => StorageDefault::Null,
            other => StorageDefault::Value(other),
        });
        self
    }

    pub fn storage_default_null(mut self) -> Self {
        self.nullable = true;
        self.storage_default = Some(StorageDefault::Null);
        self
    }

    pub fn storage_default_expression(mut self, expression: impl Into<String>) -> Self {
        self.storage_default = Some(StorageDefault::Expression(expression.into()));
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn ValueTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn logical_type(&self) -> LogicalType {
        self.logical_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn generation(&self) -> GenerationStrategy {
        self.generation
    }

    pub fn get_default(&self) -> Option<&DefaultValue> {
        self.default.as_ref()
    }

    pub fn get_storage_default(&self) -> Option<&StorageDefault> {
        self.storage_default.as_ref()
    }

    pub fn get_transformer(&self) -> Option<&Arc<dyn ValueTransformer>> {
        self.transformer.as_ref()
    }

    fn check(&self) -> Result<(), StorageError> {
        validate_identifier(&self.name)?;

        let compatible = match self.logical_type {
            LogicalType::Plain => true,
            LogicalType::Boolean => self.column_type == ColumnType::Integer,
            LogicalType::Datetime => matches!(
                self.column_type,
                ColumnType::Text | ColumnType::Integer | ColumnType::Real
            ),
        };
        if !compatible {
            return Err(StorageError::precondition(format!(
                "column {}: {:?} fields cannot be stored as {:?}",
                self.name, self.logical_type, self.column_type
            )));
        }

        match self.generation {
            GenerationStrategy::Increment
                if !self.primary || self.column_type != ColumnType::Integer =>
            {
                Err(StorageError::precondition(format!(
                    "column {}: increment generation requires an integer primary column",
                    self.name
                )))
            }
            GenerationStrategy::Uuid if self.column_type != ColumnType::Text => {
                Err(StorageError::precondition(format!(
                    "column {}: uuid generation requires a text column",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ColumnMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnMetadata")
            .field("name", &self.name)
            .field("column_type", &self.column_type)
            .field("logical_type", &self.logical_type)
            .field("nullable", &self.nullable)
            .field("unique", &self.unique)
            .field("primary", &self.primary)
            .field("generation", &self.generation)
            .field("default", &self.default)
            .field("storage_default", &self.storage_default)
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

/// Metadata for one entity type: its table and ordered columns.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    entity: String,
    table: String,
    columns: Vec<ColumnMetadata>,
}

impl EntitySchema {
    pub fn builder(entity: impl Into<String>, table: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            entity: entity.into(),
            table: table.into(),
            columns: Vec::new(),
        }
    }

    /// Entity type name, used in errors and logs.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.primary)
    }

    pub fn primary_count(&self) -> usize {
        self.primary_columns().count()
    }

    pub fn increment_column(&self) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.generation == GenerationStrategy::Increment)
    }

    pub fn has_storage_defaults(&self) -> bool {
        self.columns.iter().any(|c| c.storage_default.is_some())
    }
}

pub struct EntitySchemaBuilder {
    entity: String,
    table: String,
    columns: Vec<ColumnMetadata>,
}

impl EntitySchemaBuilder {
    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    pub fn build(self) -> Result<EntitySchema, StorageError> {
        validate_identifier(&self.table)?;
        if self.columns.is_empty() {
            return Err(StorageError::precondition(format!(
                "entity {} declares no columns",
                self.entity
            )));
        }

        for (idx, column) in self.columns.iter().enumerate() {
            column.check()?;
            if self.columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(StorageError::precondition(format!(
                    "entity {} declares column {} twice",
                    self.entity, column.name
                )));
            }
        }

        let increments = self
            .columns
            .iter()
            .filter(|c| c.generation == GenerationStrategy::Increment)
            .count();
        if increments > 1 {
            return Err(StorageError::precondition(format!(
                "entity {} declares more than one increment column",
                self.entity
            )));
        }
        let primaries = self.columns.iter().filter(|c| c.primary).count();
        if increments == 1 && primaries > 1 {
            return Err(StorageError::precondition(format!(
                "entity {} combines an increment column with a composite primary key",
                self.entity
            )));
        }

        Ok(EntitySchema {
            entity: self.entity,
            table: self.table,
            columns: self.columns,
        })
    }
}

/// Registry of entity schemas.
///
/// Lookups fail with `NotInitialized` until [`SchemaRegistry::initialize`]
/// has been called; registration is closed from then on.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<EntitySchema>>>,
    initialized: AtomicBool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: EntitySchema) -> Result<Arc<EntitySchema>, StorageError> {
        if self.is_initialized() {
            return Err(StorageError::precondition(format!(
                "cannot register {} after the registry was initialized",
                schema.entity
            )));
        }

        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        if schemas.contains_key(&schema.entity) {
            return Err(StorageError::precondition(format!(
                "entity {} is already registered",
                schema.entity
            )));
        }

        let schema = Arc::new(schema);
        schemas.insert(schema.entity.clone(), Arc::clone(&schema));
        tracing::debug!(entity = %schema.entity, table = %schema.table, "registered entity schema");
        Ok(schema)
    }

    /// Close registration and make lookups available.
    pub fn initialize(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn ensure_initialized(&self) -> Result<(), StorageError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StorageError::NotInitialized(
                "schema registry has not been initialized".to_string(),
            ))
        }
    }

    pub fn schema(&self, entity: &str) -> Result<Arc<EntitySchema>, StorageError> {
        self.ensure_initialized()?;
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned()
            .ok_or_else(|| {
                StorageError::NotInitialized(format!("entity {} is not registered", entity))
            })
    }

    /// All registered schemas, ordered by entity name.
    pub fn schemas(&self) -> Result<Vec<Arc<EntitySchema>>, StorageError> {
        self.ensure_initialized()?;
        let mut all: Vec<Arc<EntitySchema>> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.entity.cmp(&b.entity));
        Ok(all)
    }

    pub fn table_name(&self, entity: &str) -> Result<String, StorageError> {
        Ok(self.schema(entity)?.table.clone())
    }

    pub fn columns(&self, entity: &str) -> Result<Vec<ColumnMetadata>, StorageError> {
        Ok(self.schema(entity)?.columns.clone())
    }

    pub fn primary_columns(&self, entity: &str) -> Result<Vec<ColumnMetadata>, StorageError> {
        Ok(self.schema(entity)?.primary_columns().cloned().collect())
    }

    /// Whether this exact schema instance was registered here.
    pub fn contains(&self, schema: &Arc<EntitySchema>) -> bool {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&schema.entity)
            .is_some_and(|registered| Arc::ptr_eq(registered, schema))
    }
}
