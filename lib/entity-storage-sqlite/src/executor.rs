//! SQLite implementation of the store connection contract.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use entity_storage::{
    ConnectionConfig, RepositoryConnection, Row, RunResult, StorageError, StoreConnection, Value,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteStatement};
use sqlx::{ConnectOptions, Connection, Executor, Statement};
use tokio::sync::Mutex;

use crate::bind::{bind_values, extract_row};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const IN_MEMORY_URL: &str = "sqlite::memory:";

/// Connection settings applied on top of the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    pub create_if_missing: bool,
    pub foreign_keys: bool,
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            foreign_keys: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// One SQLite connection. Calls are serialized through an async mutex, so
/// statements run one at a time in the order they were issued.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<SqliteConnection>,
}

impl SqliteStore {
    /// Wrap an existing sqlx connection.
    pub fn new(conn: SqliteConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Connect with explicit options.
    pub async fn connect_with(
        config: impl Into<ConnectionConfig>,
        options: SqliteOptions,
    ) -> Result<Self, StorageError> {
        let url = match config.into() {
            ConnectionConfig::Url(url) => url,
            ConnectionConfig::InMemory => IN_MEMORY_URL.to_string(),
        };

        let connect_options = SqliteConnectOptions::from_str(&url)
            .map_err(StorageError::engine)?
            .create_if_missing(options.create_if_missing)
            .foreign_keys(options.foreign_keys)
            .busy_timeout(options.busy_timeout)
            .disable_statement_logging();

        let conn = SqliteConnection::connect_with(&connect_options)
            .await
            .map_err(StorageError::engine)?;
        tracing::debug!(url = %url, "connected to sqlite");
        Ok(Self::new(conn))
    }

    /// A private in-memory database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect(ConnectionConfig::InMemory).await
    }

    /// Close the underlying connection.
    pub async fn close(self) -> Result<(), StorageError> {
        self.conn
            .into_inner()
            .close()
            .await
            .map_err(StorageError::engine)
    }
}

#[async_trait]
impl RepositoryConnection for SqliteStore {
    async fn connect(config: impl Into<ConnectionConfig> + Send) -> Result<Self, StorageError> {
        Self::connect_with(config, SqliteOptions::default()).await
    }
}

#[async_trait]
impl StoreConnection for SqliteStore {
    type Statement = SqliteStatement<'static>;

    async fn prepare(&self, sql: &str) -> Result<Self::Statement, StorageError> {
        let mut conn = self.conn.lock().await;
        let statement = (&mut *conn)
            .prepare(sql)
            .await
            .map_err(StorageError::engine)?;
        Ok(Statement::to_owned(&statement))
    }

    async fn get(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<Option<Row>, StorageError> {
        let args = bind_values(params)?;
        let mut conn = self.conn.lock().await;
        let row = statement
            .query_with(args)
            .fetch_optional(&mut *conn)
            .await
            .map_err(StorageError::engine)?;
        row.as_ref().map(extract_row).transpose()
    }

    async fn all(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<Vec<Row>, StorageError> {
        let args = bind_values(params)?;
        let mut conn = self.conn.lock().await;
        let rows = statement
            .query_with(args)
            .fetch_all(&mut *conn)
            .await
            .map_err(StorageError::engine)?;
        rows.iter().map(extract_row).collect()
    }

    async fn run(
        &self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> Result<RunResult, StorageError> {
        let args = bind_values(params)?;
        let mut conn = self.conn.lock().await;
        let result = statement
            .query_with(args)
            .execute(&mut *conn)
            .await
            .map_err(StorageError::engine)?;
        Ok(RunResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_rowid(),
        })
    }

    async fn exec(&self, sql: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        (&mut *conn)
            .execute(sql)
            .await
            .map_err(StorageError::engine)?;
        Ok(())
    }
}
