//! Test doubles shared by unit tests.

use crate::ast::{DeleteQuery, Filter, InsertQuery, SelectQuery, Table, UpdateQuery};
use crate::engine::driver::{Command, DbSession, Driver, RowStream};
use crate::engine::{Connection, InsertOutcome, MemoryConnection, TxHandle};
use crate::error::EtlResult;
use crate::reader::{MemoryReader, RowReader};
use crate::types::{Row, Value};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Driver that records every statement and transaction boundary instead of
/// talking to a database.
#[derive(Clone, Default)]
pub struct RecordingDriver {
    log: Arc<Mutex<Vec<String>>>,
    scalar: Option<Value>,
    rows: Vec<Row>,
}

impl RecordingDriver {
    /// Queries answer with a single row holding `value`.
    pub fn with_scalar(mut self, value: Value) -> Self {
        self.scalar = Some(value);
        self
    }

    /// Streams answer with `rows`.
    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

struct RecordingSession {
    driver: RecordingDriver,
}

#[async_trait]
impl DbSession for RecordingSession {
    async fn begin(&mut self) -> EtlResult<()> {
        self.driver.record("BEGIN");
        Ok(())
    }

    async fn commit(&mut self) -> EtlResult<()> {
        self.driver.record("COMMIT");
        Ok(())
    }

    async fn rollback(&mut self) -> EtlResult<()> {
        self.driver.record("ROLLBACK");
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> EtlResult<u64> {
        self.driver.record(command.sql.clone());
        Ok(1)
    }

    async fn query(&mut self, command: &Command) -> EtlResult<Vec<Row>> {
        self.driver.record(command.sql.clone());
        Ok(self.driver.scalar.clone().map(|v| vec![vec![v]]).unwrap_or_default())
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn name(&self) -> &str {
        "recording"
    }

    async fn open(&self) -> EtlResult<Box<dyn DbSession>> {
        Ok(Box::new(RecordingSession { driver: self.clone() }))
    }

    async fn stream(&self, command: Command) -> EtlResult<RowStream> {
        self.record(command.sql);
        Ok(RowStream::from_rows(self.rows.clone()))
    }
}

/// Memory connection whose writes take `delay` and log `<op>:start:<rows>`
/// and `<op>:end:<rows>` events.
#[derive(Clone)]
pub struct DelayedConnection {
    pub inner: MemoryConnection,
    delay: Duration,
    events: Arc<Mutex<Vec<String>>>,
}

impl DelayedConnection {
    pub fn new(inner: MemoryConnection, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            events: Arc::default(),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn event(&self, operation: &str, phase: &str, rows: usize) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}:{}", operation, phase, rows));
    }

    async fn delayed<T>(&self, operation: &str, rows: usize, fut: impl Future<Output = EtlResult<T>>) -> EtlResult<T> {
        self.event(operation, "start", rows);
        tokio::time::sleep(self.delay).await;
        let result = fut.await;
        self.event(operation, "end", rows);
        result
    }
}

#[async_trait]
impl Connection for DelayedConnection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn table_exists(&self, table: &Table, tx: TxHandle) -> EtlResult<bool> {
        self.inner.table_exists(table, tx).await
    }

    async fn create_table(&self, table: &Table, drop: bool, tx: TxHandle) -> EtlResult<()> {
        self.inner.create_table(table, drop, tx).await
    }

    async fn drop_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()> {
        self.inner.drop_table(table, tx).await
    }

    async fn truncate_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()> {
        self.inner.truncate_table(table, tx).await
    }

    async fn row_count(&self, table: &Table, query: Option<&SelectQuery>, tx: TxHandle) -> EtlResult<u64> {
        self.inner.row_count(table, query, tx).await
    }

    async fn start_transaction(&self) -> EtlResult<TxHandle> {
        self.inner.start_transaction().await
    }

    async fn commit_transaction(&self, tx: TxHandle) -> EtlResult<()> {
        self.inner.commit_transaction(tx).await
    }

    async fn rollback_transaction(&self, tx: TxHandle) -> EtlResult<()> {
        self.inner.rollback_transaction(tx).await
    }

    async fn execute_insert_bulk(
        &self,
        table: &Table,
        rows: &[Row],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        self.delayed("insert", rows.len(), self.inner.execute_insert_bulk(table, rows, tx, cancel))
            .await
    }

    async fn execute_insert(
        &self,
        table: &Table,
        queries: &[InsertQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        self.delayed("insert", queries.len(), self.inner.execute_insert(table, queries, tx, cancel))
            .await
    }

    async fn execute_update(
        &self,
        table: &Table,
        queries: &[UpdateQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        self.delayed("update", queries.len(), self.inner.execute_update(table, queries, tx, cancel))
            .await
    }

    async fn execute_delete(
        &self,
        table: &Table,
        queries: &[DeleteQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        self.delayed("delete", queries.len(), self.inner.execute_delete(table, queries, tx, cancel))
            .await
    }

    async fn execute_scalar(&self, table: &Table, query: &SelectQuery, tx: TxHandle) -> EtlResult<Value> {
        self.inner.execute_scalar(table, query, tx).await
    }

    async fn reader(&self, table: &Table, query: Option<SelectQuery>) -> EtlResult<Box<dyn RowReader>> {
        self.inner.reader(table, query).await
    }
}

/// Memory reader that cancels `token` once `after` rows have been read.
pub struct CancelAfterReader {
    inner: MemoryReader,
    token: CancellationToken,
    after: usize,
    read: usize,
}

impl CancelAfterReader {
    pub fn new(inner: MemoryReader, token: CancellationToken, after: usize) -> Self {
        Self {
            inner,
            token,
            after,
            read: 0,
        }
    }
}

#[async_trait]
impl RowReader for CancelAfterReader {
    fn table(&self) -> &Table {
        self.inner.table()
    }

    async fn read(&mut self) -> EtlResult<Option<Row>> {
        // Let spawned flushes run, as a network read would.
        tokio::task::yield_now().await;
        let row = self.inner.read().await?;
        self.read += 1;
        if self.read >= self.after {
            self.token.cancel();
        }
        Ok(row)
    }

    async fn lookup_row_direct(&mut self, filters: &[Filter]) -> EtlResult<Option<Row>> {
        self.inner.lookup_row_direct(filters).await
    }
}
