//! Connection contracts between the engine and a store backend.
//!
//! - `RepositoryConnection`: connecting to a backend from configuration
//! - `StoreConnection`: preparing and running statements on one connection

use async_trait::async_trait;

use crate::{Row, StorageError, Value};

/// Connection configuration for database backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    /// Connect using a database URL string (e.g. `sqlite://app.db`).
    Url(String),
    /// A private in-memory database that lives as long as the connection.
    InMemory,
}

impl From<&str> for ConnectionConfig {
    fn from(url: &str) -> Self {
        ConnectionConfig::Url(url.to_string())
    }
}

impl From<String> for ConnectionConfig {
    fn from(url: String) -> Self {
        ConnectionConfig::Url(url)
    }
}

impl From<&String> for ConnectionConfig {
    fn from(url: &String) -> Self {
        ConnectionConfig::Url(url.clone())
    }
}

/// Trait for establishing a backend connection.
#[async_trait]
pub trait RepositoryConnection: Sized + Send + Sync {
    /// Connect to the database using the provided configuration.
    async fn connect(config: impl Into<ConnectionConfig> + Send) -> Result<Self, StorageError>;
}

/// Mutation summary returned by `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunResult {
    pub rows_affected: u64,
    /// Rowid of the most recent successful insert on the connection.
    pub last_insert_id: i64,
}

/// The store connection contract.
///
/// A connection executes one statement at a time; implementations serialize
/// concurrent callers. Errors raised by the engine are returned as
/// [`StorageError::Engine`] so they can be propagated unchanged.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Compiled statement handle.
    type Statement: Send + Sync + 'static;

    /// Compile `sql` into a reusable handle.
    async fn prepare(&self, sql: &str) -> Result<Self::Statement, StorageError>;

    /// Run a query and return its first row, if any.
    async fn get(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<Option<Row>, StorageError>;

    /// Run a query and return all rows.
    async fn all(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<Vec<Row>, StorageError>;

    /// Run a mutation and report rows affected and the last insert id.
    async fn run(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<RunResult, StorageError>;

    /// Execute raw SQL without parameters (DDL, transaction control).
    async fn exec(&self, sql: &str) -> Result<(), StorageError>;
}
