//! Active-record lifecycle: build, save, update, remove, reload.
//!
//! An [`Entity`] holds field values for one row of a registered
//! [`EntitySchema`] and tracks whether that row exists yet. The
//! [`EntityManager`] drives every store interaction through the statement
//! builder and the statement cache.
//!
//! # Change tracking
//!
//! `is_changed` and `changes` compare current values with those captured at
//! the last load or save. Comparison is shallow: scalars compare by value,
//! arrays and objects compare by identity of the stored value. Assigning a
//! field through [`Entity::set`] always stores a new value, so reassigning a
//! structurally equal object still counts as a change.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::cache::StatementCache;
use crate::codec::{decode_row, encode_field};
use crate::error::{FieldViolation, Operation};
use crate::query::{self, Conditions, Data, Scope};
use crate::schema::{EntitySchema, GenerationStrategy, SchemaRegistry};
use crate::transaction::TransactionManager;
use crate::{Row, StorageError, StoreConnection, Value};

type Field = Arc<JsonValue>;

/// One entity instance: field values plus lifecycle state.
pub struct Entity<T> {
    schema: Arc<EntitySchema>,
    fields: BTreeMap<String, Field>,
    original: BTreeMap<String, Field>,
    is_new: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Entity<T> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            fields: self.fields.clone(),
            original: self.original.clone(),
            is_new: self.is_new,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("entity", &self.schema.entity())
            .field("is_new", &self.is_new)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Shallow equality: scalars by value, arrays and objects by identity.
fn same_value(a: &Field, b: &Field) -> bool {
    match (a.as_ref(), b.as_ref()) {
        (JsonValue::Array(_) | JsonValue::Object(_), _)
        | (_, JsonValue::Array(_) | JsonValue::Object(_)) => Arc::ptr_eq(a, b),
        (x, y) => x == y,
    }
}

impl<T> Entity<T> {
    /// Assign fields from `data` without touching the store.
    ///
    /// `data` must serialize to an object; keys that are not columns of
    /// `schema` are ignored. The entity starts transient.
    pub fn build(schema: &Arc<EntitySchema>, data: &impl Serialize) -> Result<Self, StorageError> {
        let object = match serde_json::to_value(data)? {
            JsonValue::Object(object) => object,
            JsonValue::Null => serde_json::Map::new(),
            other => {
                return Err(StorageError::precondition(format!(
                    "{} data must be an object, got {}",
                    schema.entity(),
                    other
                )));
            }
        };

        let fields = object
            .into_iter()
            .filter(|(name, _)| schema.column(name).is_some())
            .map(|(name, value)| (name, Arc::new(value)))
            .collect::<BTreeMap<_, _>>();

        Ok(Self {
            schema: Arc::clone(schema),
            original: fields.clone(),
            fields,
            is_new: true,
            _marker: PhantomData,
        })
    }

    pub(crate) fn from_row(schema: &Arc<EntitySchema>, row: &Row) -> Result<Self, StorageError> {
        let fields: BTreeMap<String, Field> = decode_row(schema, row)?
            .into_iter()
            .map(|(name, value)| (name, Arc::new(value)))
            .collect();

        Ok(Self {
            schema: Arc::clone(schema),
            original: fields.clone(),
            fields,
            is_new: false,
            _marker: PhantomData,
        })
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// True until the entity has been inserted or loaded.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).map(AsRef::as_ref)
    }

    /// Deserialize a single field.
    pub fn get_as<V: DeserializeOwned>(&self, name: &str) -> Result<Option<V>, StorageError> {
        match self.get(name) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Whether the field holds a non-null value.
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some_and(|value| !value.is_null())
    }

    /// Assign a field. Only schema columns can be assigned.
    pub fn set(&mut self, name: &str, value: impl Serialize) -> Result<(), StorageError> {
        if self.schema.column(name).is_none() {
            return Err(StorageError::precondition(format!(
                "{} has no column {}",
                self.schema.entity(),
                name
            )));
        }
        let value = serde_json::to_value(value)?;
        self.fields.insert(name.to_string(), Arc::new(value));
        Ok(())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    /// Current fields as a JSON object.
    pub fn to_json(&self) -> serde_json::Map<String, JsonValue> {
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.as_ref().clone()))
            .collect()
    }

    pub fn is_changed(&self) -> bool {
        self.fields.len() != self.original.len()
            || self
                .fields
                .iter()
                .any(|(name, value)| !self.is_original(name, value))
    }

    /// Fields whose value differs from the one captured at last load or save.
    pub fn changes(&self) -> BTreeMap<String, JsonValue> {
        let mut changes: BTreeMap<String, JsonValue> = self
            .fields
            .iter()
            .filter(|(name, value)| !self.is_original(name, value))
            .map(|(name, value)| (name.clone(), value.as_ref().clone()))
            .collect();
        for name in self.original.keys() {
            if !self.fields.contains_key(name) {
                changes.insert(name.clone(), JsonValue::Null);
            }
        }
        changes
    }

    /// Equality conditions identifying this entity's row.
    pub fn primary_key(&self) -> Result<Conditions, StorageError> {
        let mut conditions = Conditions::new();
        for column in self.schema.primary_columns() {
            let value = self.get(column.name()).filter(|v| !v.is_null()).ok_or_else(|| {
                StorageError::precondition(format!(
                    "{} is missing primary key value {} ({} of {} present)",
                    self.schema.entity(),
                    column.name(),
                    self.present_primary_values(),
                    self.schema.primary_count()
                ))
            })?;
            conditions.insert(column.name(), encode_field(column, value)?);
        }
        Ok(conditions)
    }

    fn present_primary_values(&self) -> usize {
        self.schema
            .primary_columns()
            .filter(|c| self.is_set(c.name()))
            .count()
    }

    fn set_raw(&mut self, name: &str, value: JsonValue) {
        self.fields.insert(name.to_string(), Arc::new(value));
    }

    fn replace_fields(&mut self, fields: BTreeMap<String, JsonValue>) {
        self.fields = fields
            .into_iter()
            .map(|(name, value)| (name, Arc::new(value)))
            .collect();
    }

    fn capture(&mut self) {
        self.original = self.fields.clone();
    }

    fn is_original(&self, name: &str, value: &Field) -> bool {
        self.original
            .get(name)
            .is_some_and(|original| same_value(original, value))
    }
}

impl<T: DeserializeOwned> Entity<T> {
    /// Convert the current fields into the plain data struct.
    pub fn model(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_value(JsonValue::Object(self.to_json()))?)
    }
}

/// Field-level validation run before every save.
pub trait EntityValidator: Send + Sync {
    fn validate(
        &self,
        schema: &EntitySchema,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Vec<FieldViolation>;
}

impl<F> EntityValidator for F
where
    F: Fn(&EntitySchema, &serde_json::Map<String, JsonValue>) -> Vec<FieldViolation>
        + Send
        + Sync,
{
    fn validate(
        &self,
        schema: &EntitySchema,
        fields: &serde_json::Map<String, JsonValue>,
    ) -> Vec<FieldViolation> {
        self(schema, fields)
    }
}

/// Wrap a lower-level error at the lifecycle boundary.
///
/// Errors callers branch on pass through untouched; everything else is logged
/// and reported as `StoreOperationFailed`.
fn store_failure(operation: Operation, schema: &EntitySchema, error: StorageError) -> StorageError {
    if error.is_passthrough() {
        return error;
    }
    tracing::error!(
        entity = schema.entity(),
        table = schema.table(),
        %operation,
        %error,
        "store operation failed"
    );
    StorageError::StoreOperationFailed {
        operation,
        entity: schema.entity().to_string(),
        source: Box::new(error),
    }
}

/// Persistence engine bound to one store connection.
pub struct EntityManager<C: StoreConnection> {
    conn: Arc<C>,
    registry: Arc<SchemaRegistry>,
    cache: Arc<StatementCache<C::Statement>>,
    validator: Option<Arc<dyn EntityValidator>>,
    transactions: TransactionManager<C>,
}

impl<C: StoreConnection> EntityManager<C> {
    pub fn new(conn: Arc<C>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            transactions: TransactionManager::new(Arc::clone(&conn)),
            conn,
            registry,
            cache: Arc::new(StatementCache::new()),
            validator: None,
        }
    }

    /// Share an existing statement cache for this connection.
    pub fn with_cache(mut self, cache: Arc<StatementCache<C::Statement>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_validator(mut self, validator: impl EntityValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<StatementCache<C::Statement>> {
        &self.cache
    }

    pub fn transactions(&self) -> &TransactionManager<C> {
        &self.transactions
    }

    fn ensure_ready(&self, schema: &Arc<EntitySchema>) -> Result<(), StorageError> {
        self.registry.ensure_initialized()?;
        if self.registry.contains(schema) {
            Ok(())
        } else {
            Err(StorageError::NotInitialized(format!(
                "entity {} is not registered",
                schema.entity()
            )))
        }
    }

    fn check_columns<'a>(
        schema: &EntitySchema,
        columns: impl Iterator<Item = &'a String>,
    ) -> Result<(), StorageError> {
        for column in columns {
            if schema.column(column).is_none() {
                return Err(StorageError::precondition(format!(
                    "{} has no column {}",
                    schema.entity(),
                    column
                )));
            }
        }
        Ok(())
    }

    fn validate<T>(&self, entity: &Entity<T>) -> Result<(), StorageError> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let violations = validator.validate(&entity.schema, &entity.to_json());
        if violations.is_empty() {
            Ok(())
        } else {
            Err(StorageError::ValidationFailed(violations))
        }
    }

    /// Build an entity and save it.
    pub async fn create<T>(
        &self,
        schema: &Arc<EntitySchema>,
        data: &impl Serialize,
    ) -> Result<Entity<T>, StorageError> {
        let mut entity = Entity::build(schema, data)?;
        self.save(&mut entity).await?;
        Ok(entity)
    }

    /// Insert a transient entity or update a persisted one.
    pub async fn save<T>(&self, entity: &mut Entity<T>) -> Result<(), StorageError> {
        let schema = Arc::clone(&entity.schema);
        self.ensure_ready(&schema)?;
        if schema.primary_count() == 0 {
            return Err(StorageError::precondition(format!(
                "{} declares no primary key",
                schema.entity()
            )));
        }
        self.validate(entity)?;

        if entity.is_new {
            self.insert(entity)
                .await
                .map_err(|e| store_failure(Operation::Insert, &schema, e))
        } else {
            self.update(entity)
                .await
                .map_err(|e| store_failure(Operation::Update, &schema, e))
        }
    }

    async fn insert<T>(&self, entity: &mut Entity<T>) -> Result<(), StorageError> {
        let schema = Arc::clone(&entity.schema);

        for column in schema.columns() {
            if entity.is_set(column.name()) {
                continue;
            }
            match column.generation() {
                GenerationStrategy::Uuid => {
                    entity.set_raw(column.name(), JsonValue::String(Uuid::new_v4().to_string()));
                }
                GenerationStrategy::Increment => {}
                GenerationStrategy::None => {
                    if let (Some(default), None) =
                        (column.get_default(), column.get_storage_default())
                    {
                        entity.set_raw(column.name(), default.resolve());
                    }
                }
            }
        }

        let mut data = Data::new();
        for column in schema.columns() {
            if column.generation() == GenerationStrategy::Increment {
                continue;
            }
            if let Some(value) = entity.get(column.name()).filter(|v| !v.is_null()) {
                data.push(column.name(), encode_field(column, value)?);
            }
        }

        let statement = query::insert(schema.table(), &data)?;
        let result = self
            .cache
            .run(&*self.conn, &statement.sql, &statement.params)
            .await?;

        if let Some(column) = schema.increment_column() {
            entity.set_raw(column.name(), JsonValue::from(result.last_insert_id));
        }
        entity.is_new = false;

        if schema.has_storage_defaults() {
            self.refresh(entity).await?;
        }
        entity.capture();

        tracing::debug!(
            entity = schema.entity(),
            table = schema.table(),
            last_insert_id = result.last_insert_id,
            "inserted entity"
        );
        Ok(())
    }

    async fn update<T>(&self, entity: &mut Entity<T>) -> Result<(), StorageError> {
        let schema = Arc::clone(&entity.schema);

        let mut data = Data::new();
        for (name, value) in entity.changes() {
            let Some(column) = schema.column(&name) else {
                continue;
            };
            if column.is_primary() {
                continue;
            }
            data.push(name, encode_field(column, &value)?);
        }

        if data.is_empty() {
            tracing::trace!(entity = schema.entity(), "no changes to update");
            return Ok(());
        }

        let conditions = entity.primary_key()?;
        let statement = query::update(schema.table(), &data, &conditions, Scope::Conditional)?;
        let result = self
            .cache
            .run(&*self.conn, &statement.sql, &statement.params)
            .await?;
        entity.capture();

        tracing::debug!(
            entity = schema.entity(),
            table = schema.table(),
            columns = data.len(),
            rows_affected = result.rows_affected,
            "updated entity"
        );
        Ok(())
    }

    /// Delete the entity's row; the entity becomes transient again.
    pub async fn remove<T>(&self, entity: &mut Entity<T>) -> Result<(), StorageError> {
        let schema = Arc::clone(&entity.schema);
        self.ensure_ready(&schema)?;
        if entity.is_new {
            return Err(StorageError::precondition(format!(
                "cannot remove a transient {}",
                schema.entity()
            )));
        }

        let conditions = entity.primary_key()?;
        let statement = query::delete(schema.table(), &conditions, Scope::Conditional)?;
        self.cache
            .run(&*self.conn, &statement.sql, &statement.params)
            .await
            .map_err(|e| store_failure(Operation::Delete, &schema, e))?;
        entity.is_new = true;

        tracing::debug!(entity = schema.entity(), table = schema.table(), "removed entity");
        Ok(())
    }

    /// Re-fetch the entity's row and overwrite every field.
    pub async fn reload<T>(&self, entity: &mut Entity<T>) -> Result<(), StorageError> {
        let schema = Arc::clone(&entity.schema);
        self.ensure_ready(&schema)?;
        if entity.is_new {
            return Err(StorageError::precondition(format!(
                "cannot reload a transient {}",
                schema.entity()
            )));
        }

        self.refresh(entity)
            .await
            .map_err(|e| store_failure(Operation::Select, &schema, e))?;
        entity.capture();
        Ok(())
    }

    async fn refresh<T>(&self, entity: &mut Entity<T>) -> Result<(), StorageError> {
        let conditions = entity.primary_key()?;
        let statement = query::select(entity.schema.table(), &conditions, Some(1))?;
        let row = self
            .cache
            .get(&*self.conn, &statement.sql, &statement.params)
            .await?
            .ok_or_else(|| StorageError::EntityNotFound {
                entity: entity.schema.entity().to_string(),
                criteria: conditions.to_string(),
            })?;
        let fields = decode_row(&entity.schema, &row)?;
        entity.replace_fields(fields);
        Ok(())
    }

    /// All entities matching `conditions`.
    pub async fn find<T>(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &Conditions,
    ) -> Result<Vec<Entity<T>>, StorageError> {
        self.ensure_ready(schema)?;
        Self::check_columns(schema, conditions.columns())?;

        let statement = query::select(schema.table(), conditions, None)?;
        let rows = self
            .cache
            .all(&*self.conn, &statement.sql, &statement.params)
            .await
            .map_err(|e| store_failure(Operation::Select, schema, e))?;

        rows.iter()
            .map(|row| Entity::from_row(schema, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| store_failure(Operation::Select, schema, e))
    }

    /// First entity matching `conditions`, if any.
    pub async fn find_one<T>(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &Conditions,
    ) -> Result<Option<Entity<T>>, StorageError> {
        self.ensure_ready(schema)?;
        Self::check_columns(schema, conditions.columns())?;

        let statement = query::select(schema.table(), conditions, Some(1))?;
        let row = self
            .cache
            .get(&*self.conn, &statement.sql, &statement.params)
            .await
            .map_err(|e| store_failure(Operation::Select, schema, e))?;

        row.map(|row| Entity::from_row(schema, &row))
            .transpose()
            .map_err(|e| store_failure(Operation::Select, schema, e))
    }

    /// Fetch by single-column primary key; a missing row is `EntityNotFound`.
    pub async fn get<T>(
        &self,
        schema: &Arc<EntitySchema>,
        key: impl Into<Value>,
    ) -> Result<Entity<T>, StorageError> {
        self.get_by_key(schema, vec![key.into()]).await
    }

    /// Fetch by primary key values given in primary column order.
    pub async fn get_by_key<T>(
        &self,
        schema: &Arc<EntitySchema>,
        key: Vec<Value>,
    ) -> Result<Entity<T>, StorageError> {
        self.ensure_ready(schema)?;
        let primary: Vec<_> = schema.primary_columns().collect();
        if primary.is_empty() || primary.len() != key.len() {
            return Err(StorageError::precondition(format!(
                "{} has {} primary key columns, got {} values",
                schema.entity(),
                primary.len(),
                key.len()
            )));
        }

        let conditions: Conditions = primary
            .iter()
            .map(|column| column.name().to_string())
            .zip(key)
            .collect();
        self.find_one(schema, &conditions)
            .await?
            .ok_or_else(|| StorageError::EntityNotFound {
                entity: schema.entity().to_string(),
                criteria: conditions.to_string(),
            })
    }

    pub async fn count(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &Conditions,
    ) -> Result<u64, StorageError> {
        self.ensure_ready(schema)?;
        Self::check_columns(schema, conditions.columns())?;

        let statement = query::count(schema.table(), conditions)?;
        let row = self
            .cache
            .get(&*self.conn, &statement.sql, &statement.params)
            .await
            .map_err(|e| store_failure(Operation::Count, schema, e))?;

        let count = row
            .as_ref()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn exists(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &Conditions,
    ) -> Result<bool, StorageError> {
        self.ensure_ready(schema)?;
        Self::check_columns(schema, conditions.columns())?;

        let statement = query::exists(schema.table(), conditions)?;
        let row = self
            .cache
            .get(&*self.conn, &statement.sql, &statement.params)
            .await
            .map_err(|e| store_failure(Operation::Select, schema, e))?;
        Ok(row.is_some())
    }

    /// Delete every row matching `conditions` and return how many went.
    ///
    /// Empty conditions are rejected before reaching the store unless
    /// `scope` is [`Scope::Unconditional`].
    pub async fn delete_all(
        &self,
        schema: &Arc<EntitySchema>,
        conditions: &Conditions,
        scope: Scope,
    ) -> Result<u64, StorageError> {
        self.ensure_ready(schema)?;
        Self::check_columns(schema, conditions.columns())?;

        let statement = query::delete(schema.table(), conditions, scope)?;
        let result = self
            .cache
            .run(&*self.conn, &statement.sql, &statement.params)
            .await
            .map_err(|e| store_failure(Operation::Delete, schema, e))?;

        tracing::debug!(
            entity = schema.entity(),
            table = schema.table(),
            rows_affected = result.rows_affected,
            "deleted rows"
        );
        Ok(result.rows_affected)
    }

    /// Set the columns in `data` on every row matching `conditions`.
    pub async fn update_all(
        &self,
        schema: &Arc<EntitySchema>,
        data: &impl Serialize,
        conditions: &Conditions,
        scope: Scope,
    ) -> Result<u64, StorageError> {
        self.ensure_ready(schema)?;
        Self::check_columns(schema, conditions.columns())?;

        let JsonValue::Object(object) = serde_json::to_value(data)? else {
            return Err(StorageError::precondition(format!(
                "{} update data must be an object",
                schema.entity()
            )));
        };

        let mut values = Data::new();
        for (name, value) in &object {
            let column = schema.column(name).ok_or_else(|| {
                StorageError::precondition(format!("{} has no column {}", schema.entity(), name))
            })?;
            let encoded = encode_field(column, value)
                .map_err(|e| store_failure(Operation::Update, schema, e))?;
            values.push(name.clone(), encoded);
        }

        let statement = query::update(schema.table(), &values, conditions, scope)?;
        let result = self
            .cache
            .run(&*self.conn, &statement.sql, &statement.params)
            .await
            .map_err(|e| store_failure(Operation::Update, schema, e))?;
        Ok(result.rows_affected)
    }

    /// Create every registered table that does not exist yet.
    pub async fn synchronize(&self) -> Result<(), StorageError> {
        for schema in self.registry.schemas()? {
            let ddl = query::create_table(&schema)?;
            self.conn
                .exec(&ddl)
                .await
                .map_err(|e| store_failure(Operation::Synchronize, &schema, e))?;
            tracing::debug!(entity = schema.entity(), table = schema.table(), "synchronized table");
        }
        Ok(())
    }
}
