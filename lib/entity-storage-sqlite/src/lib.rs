//! SQLite store connection for entity-storage.
//!
//! [`SqliteStore`] implements [`StoreConnection`] on top of a single sqlx
//! SQLite connection, so an [`EntityManager`] can run against it directly.
//!
//! # Usage
//!
//! ```text
//! use std::sync::Arc;
//! use entity_storage::{EntityManager, RepositoryConnection, SchemaRegistry};
//! use entity_storage_sqlite::SqliteStore;
//!
//! let registry = Arc::new(SchemaRegistry::new());
//! let users = registry.register(user_schema())?;
//! registry.initialize();
//!
//! let store = Arc::new(SqliteStore::connect("sqlite://app.db").await?);
//! let manager = EntityManager::new(store, registry);
//! manager.synchronize().await?;
//! ```

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::unwrap_in_result,
        clippy::panic
    )
)]

mod bind;
mod executor;

pub use executor::{SqliteOptions, SqliteStore};

// Re-export core types for convenience
pub use entity_storage::{
    ConnectionConfig, Entity, EntityManager, RepositoryConnection, SchemaRegistry, StorageError,
    StoreConnection,
};
