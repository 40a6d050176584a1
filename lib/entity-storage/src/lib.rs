//! Entity Storage - metadata-driven persistence over an embedded SQL engine.
//!
//! This crate provides the backend-agnostic core of an Active-Record style
//! storage layer: declarative entity metadata drives SQL generation, entities
//! track their own lifecycle, compiled statements are cached per SQL text, and
//! transactions support nested named savepoints.
//!
//! # Core Concepts
//!
//! - **Schema**: an [`EntitySchema`] names the entity, its table and its
//!   columns. Schemas are registered in a [`SchemaRegistry`] which must be
//!   initialized before any store operation.
//! - **Entity**: an [`Entity`] is either transient (never stored) or
//!   persisted. `save` inserts the former and updates only changed columns of
//!   the latter.
//! - **Statement cache**: every statement runs through a [`StatementCache`]
//!   keyed by exact SQL text.
//!
//! # Traits
//!
//! - [`StoreConnection`]: prepare and run statements on a backend connection
//! - [`RepositoryConnection`]: connect a backend from a [`ConnectionConfig`]
//! - [`ValueTransformer`]: custom column encoding
//! - [`EntityValidator`]: field validation before save

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::unwrap_in_result,
        clippy::panic
    )
)]

mod cache;
mod codec;
mod entity;
mod error;
pub mod query;
mod repository;
mod schema;
mod time;
mod transaction;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, QueryMode, QueryResult, StatementCache};
pub use codec::{ValueTransformer, decode_field, decode_row, encode_field, value_to_json};
pub use entity::{Entity, EntityManager, EntityValidator};
pub use error::{EngineError, FieldViolation, Operation, StorageError};
pub use query::{Conditions, Data, Row, Scope, Statement, Value};
pub use repository::{ConnectionConfig, RepositoryConnection, RunResult, StoreConnection};
pub use schema::{
    ColumnMetadata, ColumnType, DefaultValue, EntitySchema, EntitySchemaBuilder,
    GenerationStrategy, LogicalType, SchemaRegistry, StorageDefault,
};
pub use time::StorageDatetime;
pub use transaction::{
    Savepoint, Transaction, TransactionManager, TransactionMode, TransactionState,
};
