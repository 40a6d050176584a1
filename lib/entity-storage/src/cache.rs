//! Prepared statement cache keyed by exact SQL text.
//!
//! The cache is unbounded and caller-managed: entries live until they are
//! invalidated, cleared, or the cache is disabled. There is no TTL and no
//! eviction policy. A given SQL text maps to at most one live handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Row, RunResult, StorageError, StoreConnection, Value};

/// Shape of the result wanted from [`StatementCache::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// First row only.
    One,
    /// Every row.
    All,
    /// Mutation summary.
    Run,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Row(Option<Row>),
    Rows(Vec<Row>),
    Run(RunResult),
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    /// `hit_count / (hit_count + miss_count)`, or 0 before the first lookup.
    pub hit_rate: f64,
    pub size: usize,
    pub enabled: bool,
}

pub struct StatementCache<S> {
    entries: Mutex<HashMap<String, Arc<S>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    enabled: AtomicBool,
}

impl<S> Default for StatementCache<S> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }
}

impl<S: Send + Sync + 'static> std::fmt::Debug for StatementCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<S: Send + Sync + 'static> StatementCache<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the handle for `sql`, preparing and storing it on a miss.
    ///
    /// While the cache is disabled every call prepares a fresh handle that is
    /// not retained.
    pub async fn get_statement<C>(&self, conn: &C, sql: &str) -> Result<Arc<S>, StorageError>
    where
        C: StoreConnection<Statement = S> + ?Sized,
    {
        if !self.is_enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sql, "statement cache disabled, preparing uncached statement");
            return Ok(Arc::new(conn.prepare(sql).await?));
        }

        if let Some(handle) = self.entries().get(sql) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(sql, "statement cache hit");
            return Ok(Arc::clone(handle));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(sql, "statement cache miss, preparing");
        let prepared = Arc::new(conn.prepare(sql).await?);

        // Another caller may have prepared the same SQL while we were awaiting;
        // keep whichever handle landed first.
        if !self.is_enabled() {
            return Ok(prepared);
        }
        let mut entries = self.entries();
        let handle = entries.entry(sql.to_string()).or_insert(prepared);
        Ok(Arc::clone(handle))
    }

    /// Execute `sql` with positional `params` through a cached handle.
    pub async fn execute<C>(
        &self,
        conn: &C,
        sql: &str,
        params: &[Value],
        mode: QueryMode,
    ) -> Result<QueryResult, StorageError>
    where
        C: StoreConnection<Statement = S> + ?Sized,
    {
        let statement = self.get_statement(conn, sql).await?;
        match mode {
            QueryMode::One => Ok(QueryResult::Row(conn.get(&statement, params).await?)),
            QueryMode::All => Ok(QueryResult::Rows(conn.all(&statement, params).await?)),
            QueryMode::Run => Ok(QueryResult::Run(conn.run(&statement, params).await?)),
        }
    }

    pub async fn get<C>(
        &self,
        conn: &C,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Row>, StorageError>
    where
        C: StoreConnection<Statement = S> + ?Sized,
    {
        let statement = self.get_statement(conn, sql).await?;
        conn.get(&statement, params).await
    }

    pub async fn all<C>(
        &self,
        conn: &C,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, StorageError>
    where
        C: StoreConnection<Statement = S> + ?Sized,
    {
        let statement = self.get_statement(conn, sql).await?;
        conn.all(&statement, params).await
    }

    pub async fn run<C>(
        &self,
        conn: &C,
        sql: &str,
        params: &[Value],
    ) -> Result<RunResult, StorageError>
    where
        C: StoreConnection<Statement = S> + ?Sized,
    {
        let statement = self.get_statement(conn, sql).await?;
        conn.run(&statement, params).await
    }

    /// Drop every entry whose SQL text contains `pattern`.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|sql, _| !sql.contains(pattern));
        let removed = before - entries.len();
        tracing::debug!(pattern, removed, "invalidated cached statements");
        removed
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Enable or disable caching. Disabling clears every entry.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        CacheStats {
            hit_count,
            miss_count,
            hit_rate: if total == 0 {
                0.0
            } else {
                hit_count as f64 / total as f64
            },
            size: self.len(),
            enabled: self.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;

    #[tokio::test]
    async fn identical_sql_reuses_the_same_handle() {
        let conn = RecordingConnection::new();
        let cache = StatementCache::new();

        let first = cache.get_statement(&conn, "SELECT * FROM users").await.unwrap();
        let before = cache.stats();
        let second = cache.get_statement(&conn, "SELECT * FROM users").await.unwrap();
        let after = cache.stats();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(after.hit_count, before.hit_count + 1);
        assert_eq!(after.miss_count, 1);
        assert_eq!(after.size, 1);
        assert_eq!(conn.prepared(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_returns_distinct_handles() {
        let conn = RecordingConnection::new();
        let cache = StatementCache::new();
        cache.get_statement(&conn, "SELECT 1").await.unwrap();

        cache.set_enabled(false);
        assert_eq!(cache.len(), 0);

        let first = cache.get_statement(&conn, "SELECT 1").await.unwrap();
        let second = cache.get_statement(&conn, "SELECT 1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert!(!stats.enabled);
        assert_eq!(stats.hit_count, 0);

        cache.set_enabled(true);
        let third = cache.get_statement(&conn, "SELECT 1").await.unwrap();
        let fourth = cache.get_statement(&conn, "SELECT 1").await.unwrap();
        assert!(Arc::ptr_eq(&third, &fourth));
    }

    #[tokio::test]
    async fn invalidate_removes_matching_entries_only() {
        let conn = RecordingConnection::new();
        let cache = StatementCache::new();
        for sql in [
            "SELECT * FROM users",
            "DELETE FROM users WHERE id = ?",
            "SELECT * FROM posts",
        ] {
            cache.get_statement(&conn, sql).await.unwrap();
        }

        assert_eq!(cache.invalidate("users"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate("users"), 0);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn hit_rate_reflects_lookups() {
        let conn = RecordingConnection::new();
        let cache = StatementCache::new();
        assert_eq!(cache.stats().hit_rate, 0.0);

        for _ in 0..4 {
            cache.get_statement(&conn, "SELECT 2").await.unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.hit_count, 3);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn engine_errors_propagate_unchanged() {
        let conn = RecordingConnection::new();
        conn.fail_on("broken");
        let cache = StatementCache::new();

        let err = cache
            .execute(&conn, "SELECT broken FROM nowhere", &[], QueryMode::All)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Engine(_)));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn execute_dispatches_on_mode() {
        let conn = RecordingConnection::new();
        let cache = StatementCache::new();

        let result = cache
            .execute(&conn, "UPDATE users SET name = ?", &[Value::from("x")], QueryMode::Run)
            .await
            .unwrap();
        assert!(matches!(result, QueryResult::Run(_)));

        let result = cache
            .execute(&conn, "SELECT * FROM users", &[], QueryMode::One)
            .await
            .unwrap();
        assert_eq!(result, QueryResult::Row(None));

        let result = cache
            .execute(&conn, "SELECT * FROM users", &[], QueryMode::All)
            .await
            .unwrap();
        assert_eq!(result, QueryResult::Rows(Vec::new()));
    }

    #[tokio::test]
    async fn debug_output_reports_counters() {
        let conn = RecordingConnection::new();
        let cache = StatementCache::new();
        cache.get_statement(&conn, "SELECT 1").await.unwrap();

        let rendered = format!("{cache:?}");
        assert!(rendered.starts_with("StatementCache"));
        assert!(rendered.contains("miss_count: 1"));
    }
}
