//! In-process connection double for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Row, RunResult, StorageError, StoreConnection, Value};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FakeStatement {
    pub id: usize,
    pub sql: String,
}

/// Records every call and answers with scripted rows.
#[derive(Default)]
pub(crate) struct RecordingConnection {
    log: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    fail_pattern: Mutex<Option<String>>,
    rows: Mutex<VecDeque<Option<Row>>>,
    insert_id: Mutex<i64>,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every prepare/exec whose SQL contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        *self.fail_pattern.lock().unwrap() = Some(pattern.to_string());
    }

    pub fn push_row(&self, row: Option<Row>) {
        self.rows.lock().unwrap().push_back(row);
    }

    pub fn set_insert_id(&self, id: i64) {
        *self.insert_id.lock().unwrap() = id;
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Calls that reached the store, excluding preparation.
    pub fn store_calls(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| !entry.starts_with("prepare "))
            .collect()
    }

    pub fn prepared(&self) -> usize {
        self.log()
            .iter()
            .filter(|entry| entry.starts_with("prepare "))
            .count()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn check(&self, sql: &str) -> Result<(), StorageError> {
        match self.fail_pattern.lock().unwrap().as_deref() {
            Some(pattern) if sql.contains(pattern) => {
                Err(StorageError::engine(format!("near \"{}\": syntax error", pattern)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StoreConnection for RecordingConnection {
    type Statement = FakeStatement;

    async fn prepare(&self, sql: &str) -> Result<FakeStatement, StorageError> {
        self.check(sql)?;
        self.record(format!("prepare {}", sql));
        Ok(FakeStatement {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            sql: sql.to_string(),
        })
    }

    async fn get(
        &self,
        statement: &FakeStatement,
        params: &[Value],
    ) -> Result<Option<Row>, StorageError> {
        self.record(format!("get {} {:?}", statement.sql, params));
        Ok(self.rows.lock().unwrap().pop_front().flatten())
    }

    async fn all(
        &self,
        statement: &FakeStatement,
        params: &[Value],
    ) -> Result<Vec<Row>, StorageError> {
        self.record(format!("all {} {:?}", statement.sql, params));
        Ok(self.rows.lock().unwrap().drain(..).flatten().collect())
    }

    async fn run(
        &self,
        statement: &FakeStatement,
        params: &[Value],
    ) -> Result<RunResult, StorageError> {
        self.record(format!("run {} {:?}", statement.sql, params));
        Ok(RunResult {
            rows_affected: 1,
            last_insert_id: *self.insert_id.lock().unwrap(),
        })
    }

    async fn exec(&self, sql: &str) -> Result<(), StorageError> {
        self.check(sql)?;
        self.record(format!("exec {}", sql));
        Ok(())
    }
}
