//! Connection-level transactions with nested named savepoints.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::query::validate_identifier;
use crate::{StorageError, StoreConnection};

/// Locking mode passed to `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionMode {
    fn begin_sql(self) -> &'static str {
        match self {
            TransactionMode::Deferred => "BEGIN DEFERRED",
            TransactionMode::Immediate => "BEGIN IMMEDIATE",
            TransactionMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Pending => "pending",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Token for a savepoint pushed onto a transaction's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    /// 1-based position on the stack when it was created.
    pub depth: usize,
}

#[derive(Debug)]
struct TransactionInner {
    state: TransactionState,
    savepoints: Vec<Savepoint>,
    created: u64,
}

impl TransactionInner {
    fn expect_state(&self, wanted: TransactionState, action: &str) -> Result<(), StorageError> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(StorageError::precondition(format!(
                "cannot {} a {} transaction",
                action, self.state
            )))
        }
    }

    fn position(&self, savepoint: &Savepoint) -> Result<usize, StorageError> {
        self.savepoints
            .iter()
            .position(|s| s == savepoint)
            .ok_or_else(|| {
                StorageError::precondition(format!(
                    "savepoint {} is not on the transaction stack",
                    savepoint.name
                ))
            })
    }
}

/// One logical transaction on a store connection.
pub struct Transaction<C: StoreConnection> {
    conn: Arc<C>,
    inner: Mutex<TransactionInner>,
}

impl<C: StoreConnection> Transaction<C> {
    pub fn new(conn: Arc<C>) -> Self {
        Self {
            conn,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Pending,
                savepoints: Vec::new(),
                created: 0,
            }),
        }
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    pub async fn begin(&self, mode: TransactionMode) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.expect_state(TransactionState::Pending, "begin")?;
        self.conn.exec(mode.begin_sql()).await?;
        inner.state = TransactionState::Active;
        tracing::debug!(?mode, "transaction started");
        Ok(())
    }

    pub async fn commit(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.expect_state(TransactionState::Active, "commit")?;
        self.conn.exec("COMMIT").await?;
        inner.state = TransactionState::Committed;
        inner.savepoints.clear();
        tracing::info!("transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.expect_state(TransactionState::Active, "roll back")?;
        self.conn.exec("ROLLBACK").await?;
        inner.state = TransactionState::RolledBack;
        inner.savepoints.clear();
        tracing::warn!("transaction rolled back");
        Ok(())
    }

    /// Push a savepoint. Without a name one is generated as `sp_<n>`.
    pub async fn savepoint(&self, name: Option<&str>) -> Result<Savepoint, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.expect_state(TransactionState::Active, "create a savepoint in")?;

        let name = match name {
            Some(name) => {
                validate_identifier(name)?;
                name.to_string()
            }
            None => format!("sp_{}", inner.created + 1),
        };
        if inner.savepoints.iter().any(|s| s.name == name) {
            return Err(StorageError::precondition(format!(
                "savepoint {} is already on the transaction stack",
                name
            )));
        }
        self.conn.exec(&format!("SAVEPOINT {}", name)).await?;

        inner.created += 1;
        let savepoint = Savepoint {
            name,
            depth: inner.savepoints.len() + 1,
        };
        inner.savepoints.push(savepoint.clone());
        tracing::debug!(savepoint = %savepoint.name, depth = savepoint.depth, "savepoint created");
        Ok(savepoint)
    }

    /// Release a savepoint and every savepoint above it. Their effects stay
    /// pending in the enclosing scope.
    pub async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.expect_state(TransactionState::Active, "release a savepoint in")?;
        let position = inner.position(savepoint)?;

        self.conn
            .exec(&format!("RELEASE SAVEPOINT {}", savepoint.name))
            .await?;
        inner.savepoints.truncate(position);
        tracing::debug!(savepoint = %savepoint.name, "savepoint released");
        Ok(())
    }

    /// Undo everything since `savepoint` and drop it from the stack. The
    /// transaction stays active.
    pub async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.expect_state(TransactionState::Active, "roll back a savepoint in")?;
        let position = inner.position(savepoint)?;

        self.conn
            .exec(&format!("ROLLBACK TO SAVEPOINT {}", savepoint.name))
            .await?;
        // ROLLBACK TO leaves the savepoint open in the engine
        self.conn
            .exec(&format!("RELEASE SAVEPOINT {}", savepoint.name))
            .await?;
        inner.savepoints.truncate(position);
        tracing::debug!(savepoint = %savepoint.name, "rolled back to savepoint");
        Ok(())
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == TransactionState::Active
    }

    /// Savepoints currently on the stack, outermost first.
    pub async fn savepoints(&self) -> Vec<Savepoint> {
        self.inner.lock().await.savepoints.clone()
    }
}

impl<C: StoreConnection> Drop for Transaction<C> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state == TransactionState::Active {
            tracing::warn!(
                savepoints = inner.savepoints.len(),
                "transaction dropped while active; the connection is still inside it"
            );
        }
    }
}

/// Runs bodies inside transactions on one connection.
pub struct TransactionManager<C: StoreConnection> {
    conn: Arc<C>,
}

impl<C: StoreConnection> Clone for TransactionManager<C> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<C: StoreConnection> TransactionManager<C> {
    pub fn new(conn: Arc<C>) -> Self {
        Self { conn }
    }

    /// A pending transaction for manual control.
    pub fn create_transaction(&self) -> Arc<Transaction<C>> {
        Arc::new(Transaction::new(Arc::clone(&self.conn)))
    }

    async fn abort(transaction: &Transaction<C>) {
        if !transaction.is_active().await {
            return;
        }
        if let Err(error) = transaction.rollback().await {
            tracing::error!(%error, "failed to roll back transaction");
        }
    }

    async fn finish<R, E>(transaction: &Transaction<C>, outcome: Result<R, E>) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        match outcome {
            Ok(value) => {
                if transaction.is_active().await {
                    if let Err(error) = transaction.commit().await {
                        Self::abort(transaction).await;
                        return Err(error.into());
                    }
                }
                Ok(value)
            }
            Err(error) => {
                Self::abort(transaction).await;
                Err(error)
            }
        }
    }

    /// Begin, run `body`, then commit. Any error from `body` rolls the
    /// transaction back and is returned as is.
    pub async fn transaction<F, Fut, R, E>(&self, mode: TransactionMode, body: F) -> Result<R, E>
    where
        F: FnOnce(Arc<Transaction<C>>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StorageError>,
    {
        let transaction = self.create_transaction();
        transaction.begin(mode).await?;
        let outcome = body(Arc::clone(&transaction)).await;
        Self::finish(&transaction, outcome).await
    }

    /// Run bodies one after another in a single transaction, stopping at the
    /// first failure.
    pub async fn transaction_sequential<I, F, Fut, R, E>(
        &self,
        mode: TransactionMode,
        bodies: I,
    ) -> Result<Vec<R>, E>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(Arc<Transaction<C>>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StorageError>,
    {
        let transaction = self.create_transaction();
        transaction.begin(mode).await?;

        let mut results = Vec::new();
        for body in bodies {
            match body(Arc::clone(&transaction)).await {
                Ok(value) => results.push(value),
                Err(error) => return Self::finish(&transaction, Err(error)).await,
            }
        }
        Self::finish(&transaction, Ok(results)).await
    }

    /// Drive every body concurrently in a single transaction. Statements
    /// still run one at a time on the connection. If any body fails the
    /// whole transaction is rolled back and the first error is returned.
    pub async fn transaction_parallel<I, F, Fut, R, E>(
        &self,
        mode: TransactionMode,
        bodies: I,
    ) -> Result<Vec<R>, E>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(Arc<Transaction<C>>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<StorageError>,
    {
        let transaction = self.create_transaction();
        transaction.begin(mode).await?;

        let outcomes =
            join_all(bodies.into_iter().map(|body| body(Arc::clone(&transaction)))).await;
        let outcome = outcomes.into_iter().collect::<Result<Vec<R>, E>>();
        Self::finish(&transaction, outcome).await
    }
}
