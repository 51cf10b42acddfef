//! The connection capability the writer and CLI talk to.

use super::driver::{Command, DbSession, Driver};
use super::transaction::{TransactionStore, TxHandle};
use crate::ast::{DeleteQuery, DeltaType, InsertQuery, SelectQuery, Table, UpdateQuery};
use crate::error::{EtlError, EtlResult};
use crate::reader::{RowReader, SqlReader};
use crate::transpiler::{self, Dialect, ParamContext, ddl, dml};
use crate::types::{Row, Value};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Result of an insert command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub rows: u64,
    /// Highest database-assigned identity after the insert, when the table
    /// has a `DbAutoIncrement` column.
    pub last_identity: Option<i64>,
}

/// A target or source store. Methods taking a [`TxHandle`] run inside that
/// transaction, or inside a private one for [`TxHandle::AUTO`].
#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    async fn table_exists(&self, table: &Table, tx: TxHandle) -> EtlResult<bool>;

    /// Create `table`; with `drop` an existing table is dropped first.
    async fn create_table(&self, table: &Table, drop: bool, tx: TxHandle) -> EtlResult<()>;

    async fn drop_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()>;

    async fn truncate_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()>;

    async fn row_count(&self, table: &Table, query: Option<&SelectQuery>, tx: TxHandle) -> EtlResult<u64>;

    async fn start_transaction(&self) -> EtlResult<TxHandle>;
    async fn commit_transaction(&self, tx: TxHandle) -> EtlResult<()>;
    async fn rollback_transaction(&self, tx: TxHandle) -> EtlResult<()>;

    /// Insert rows laid out by `table` ordinals.
    async fn execute_insert_bulk(
        &self,
        table: &Table,
        rows: &[Row],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome>;

    async fn execute_insert(
        &self,
        table: &Table,
        queries: &[InsertQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome>;

    async fn execute_update(
        &self,
        table: &Table,
        queries: &[UpdateQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64>;

    async fn execute_delete(
        &self,
        table: &Table,
        queries: &[DeleteQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64>;

    /// First value of the query's first row.
    async fn execute_scalar(&self, table: &Table, query: &SelectQuery, tx: TxHandle) -> EtlResult<Value>;

    async fn reader(&self, table: &Table, query: Option<SelectQuery>) -> EtlResult<Box<dyn RowReader>>;
}

/// [`Connection`] over a SQL [`Driver`], compiling with a [`Dialect`].
#[derive(Clone)]
pub struct ConnectionSql {
    name: String,
    driver: Arc<dyn Driver>,
    dialect: Dialect,
    transactions: Arc<TransactionStore>,
    timeout: Option<Duration>,
}

impl ConnectionSql {
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
        dialect: Dialect,
        transactions: Arc<TransactionStore>,
    ) -> Self {
        Self {
            name: name.into(),
            driver,
            dialect,
            transactions,
            timeout: None,
        }
    }

    /// Per-command timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn command(&self, sql: String, ctx: ParamContext<'_>) -> Command {
        trace!(connection = %self.name, sql = %sql, "command");
        Command::new(sql, ctx.into_params()).with_timeout(self.timeout)
    }

    fn plain(&self, sql: String) -> Command {
        self.command(sql, ParamContext::new(&self.dialect))
    }

    async fn last_identity(&self, session: &mut dyn DbSession, table: &Table) -> EtlResult<Option<i64>> {
        let Some(column) = table.column_by_delta(DeltaType::DbAutoIncrement) else {
            return Ok(None);
        };
        let value = session
            .scalar(&self.plain(ddl::build_max(table, column, &self.dialect)))
            .await?;
        Ok(value.as_i64())
    }

    async fn insert_bulk(
        &self,
        session: &mut dyn DbSession,
        table: &Table,
        rows: &[Row],
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        let chunk_size = dml::bulk_chunk_size(table, self.dialect.max_parameters);
        let mut inserted = 0;
        for chunk in rows.chunks(chunk_size) {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            let mut ctx = ParamContext::new(&self.dialect);
            let sql = dml::build_bulk_insert(table, chunk, &mut ctx)?;
            inserted += session.execute(&self.command(sql, ctx)).await?;
        }
        let last_identity = self.last_identity(session, table).await?;
        Ok(InsertOutcome {
            rows: inserted,
            last_identity,
        })
    }

    async fn insert(
        &self,
        session: &mut dyn DbSession,
        table: &Table,
        queries: &[InsertQuery],
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        let mut inserted = 0;
        for query in queries {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            let mut ctx = ParamContext::new(&self.dialect);
            let sql = dml::build_insert(table, query, &mut ctx)?;
            inserted += session.execute(&self.command(sql, ctx)).await?;
        }
        let last_identity = self.last_identity(session, table).await?;
        Ok(InsertOutcome {
            rows: inserted,
            last_identity,
        })
    }

    async fn update(
        &self,
        session: &mut dyn DbSession,
        table: &Table,
        queries: &[UpdateQuery],
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        let mut updated = 0;
        for query in queries {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            let mut ctx = ParamContext::new(&self.dialect);
            let sql = dml::build_update(table, query, &mut ctx)?;
            updated += session.execute(&self.command(sql, ctx)).await?;
        }
        Ok(updated)
    }

    async fn delete(
        &self,
        session: &mut dyn DbSession,
        table: &Table,
        queries: &[DeleteQuery],
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        let mut deleted = 0;
        for query in queries {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            let mut ctx = ParamContext::new(&self.dialect);
            let sql = dml::build_delete(table, query, &mut ctx)?;
            deleted += session.execute(&self.command(sql, ctx)).await?;
        }
        Ok(deleted)
    }

    /// Run one command in `tx`.
    async fn run(&self, command: Command, tx: TxHandle) -> EtlResult<u64> {
        let mut scope = self.transactions.acquire(self.driver.as_ref(), tx).await?;
        let result = scope.session().execute(&command).await;
        scope.finish(result).await
    }

    async fn scalar(&self, command: Command, tx: TxHandle) -> EtlResult<Value> {
        let mut scope = self.transactions.acquire(self.driver.as_ref(), tx).await?;
        let result = scope.session().scalar(&command).await;
        scope.finish(result).await
    }
}

#[async_trait]
impl Connection for ConnectionSql {
    fn name(&self) -> &str {
        &self.name
    }

    async fn table_exists(&self, table: &Table, tx: TxHandle) -> EtlResult<bool> {
        let mut ctx = ParamContext::new(&self.dialect);
        let sql = ddl::build_table_exists(table, &mut ctx);
        let count = self.scalar(self.command(sql, ctx), tx).await?;
        Ok(count.as_i64().unwrap_or(0) > 0)
    }

    async fn create_table(&self, table: &Table, drop: bool, tx: TxHandle) -> EtlResult<()> {
        let mut scope = self.transactions.acquire(self.driver.as_ref(), tx).await?;
        let result = async {
            let session = scope.session();
            if drop {
                session
                    .execute(&self.plain(ddl::build_drop_table(table, &self.dialect)))
                    .await?;
            }
            session
                .execute(&self.plain(ddl::build_create_table(table, &self.dialect)))
                .await?;
            Ok::<(), EtlError>(())
        }
        .await;
        debug!(table = %table.name, drop, "create table");
        scope
            .finish(result)
            .await
            .map_err(|e| e.with_context(format!("create table {}", table.name)))
    }

    async fn drop_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()> {
        self.run(self.plain(ddl::build_drop_table(table, &self.dialect)), tx)
            .await
            .map(|_| ())
            .map_err(|e| e.with_context(format!("drop table {}", table.name)))
    }

    async fn truncate_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()> {
        self.run(self.plain(ddl::build_truncate(table, &self.dialect)), tx)
            .await
            .map(|_| ())
            .map_err(|e| e.with_context(format!("truncate table {}", table.name)))
    }

    async fn row_count(&self, table: &Table, query: Option<&SelectQuery>, tx: TxHandle) -> EtlResult<u64> {
        let compiled = transpiler::compile_count(table, query, &self.dialect)?;
        let command = Command::from(compiled).with_timeout(self.timeout);
        let count = self.scalar(command, tx).await?;
        Ok(count.as_i64().unwrap_or(0).max(0) as u64)
    }

    async fn start_transaction(&self) -> EtlResult<TxHandle> {
        self.transactions.start(self.driver.as_ref()).await
    }

    async fn commit_transaction(&self, tx: TxHandle) -> EtlResult<()> {
        self.transactions.commit(tx).await
    }

    async fn rollback_transaction(&self, tx: TxHandle) -> EtlResult<()> {
        self.transactions.rollback(tx).await
    }

    async fn execute_insert_bulk(
        &self,
        table: &Table,
        rows: &[Row],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        if rows.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let mut scope = self.transactions.acquire(self.driver.as_ref(), tx).await?;
        let result = self.insert_bulk(scope.session(), table, rows, cancel).await;
        scope
            .finish(result)
            .await
            .map_err(|e| e.with_context(format!("insert into {}", table.name)))
    }

    async fn execute_insert(
        &self,
        table: &Table,
        queries: &[InsertQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        let mut scope = self.transactions.acquire(self.driver.as_ref(), tx).await?;
        let result = self.insert(scope.session(), table, queries, cancel).await;
        scope
            .finish(result)
            .await
            .map_err(|e| e.with_context(format!("insert into {}", table.name)))
    }

    async fn execute_update(
        &self,
        table: &Table,
        queries: &[UpdateQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        let mut scope = self.transactions.acquire(self.driver.as_ref(), tx).await?;
        let result = self.update(scope.session(), table, queries, cancel).await;
        scope
            .finish(result)
            .await
            .map_err(|e| e.with_context(format!("update {}", table.name)))
    }

    async fn execute_delete(
        &self,
        table: &Table,
        queries: &[DeleteQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        let mut scope = self.transactions.acquire(self.driver.as_ref(), tx).await?;
        let result = self.delete(scope.session(), table, queries, cancel).await;
        scope
            .finish(result)
            .await
            .map_err(|e| e.with_context(format!("delete from {}", table.name)))
    }

    async fn execute_scalar(&self, table: &Table, query: &SelectQuery, tx: TxHandle) -> EtlResult<Value> {
        let compiled = transpiler::compile(table, Some(query), &self.dialect)?;
        if !compiled.skipped_filters.is_empty() {
            return Err(EtlError::compile(format!(
                "scalar query on '{}' has filters the {} dialect cannot express",
                table.name, self.dialect.name
            )));
        }
        let command = Command::from(compiled).with_timeout(self.timeout);
        self.scalar(command, tx).await
    }

    async fn reader(&self, table: &Table, query: Option<SelectQuery>) -> EtlResult<Box<dyn RowReader>> {
        let reader = SqlReader::open(
            Arc::clone(&self.driver),
            self.dialect.clone(),
            table.clone(),
            query,
            self.timeout,
        )
        .await?;
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Column;
    use crate::testing::RecordingDriver;
    use crate::types::TypeCode;

    fn connection(driver: &RecordingDriver) -> ConnectionSql {
        ConnectionSql::new(
            "target",
            Arc::new(driver.clone()),
            Dialect::sqlite(),
            Arc::new(TransactionStore::new()),
        )
    }

    fn people() -> Table {
        Table::with_columns(
            "people",
            vec![
                Column::with_role("id", DeltaType::DbAutoIncrement),
                Column::new("name", TypeCode::String),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bulk_insert_reads_back_identity() {
        let driver = RecordingDriver::default().with_scalar(Value::Int(12));
        let conn = connection(&driver);
        let rows = vec![vec![Value::Null, "a".into()], vec![Value::Null, "b".into()]];
        let outcome = conn
            .execute_insert_bulk(&people(), &rows, TxHandle::AUTO, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.last_identity, Some(12));
        assert_eq!(
            driver.log(),
            vec![
                "BEGIN",
                "INSERT INTO \"people\" (\"name\") VALUES (?), (?)",
                "SELECT MAX(\"id\") FROM \"people\"",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_insert_rolls_back() {
        let driver = RecordingDriver::default();
        let conn = connection(&driver);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = conn
            .execute_insert_bulk(&people(), &[vec![Value::Null, "a".into()]], TxHandle::AUTO, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(driver.log(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_explicit_transaction_spans_commands() {
        let driver = RecordingDriver::default();
        let conn = connection(&driver);
        let tx = conn.start_transaction().await.unwrap();
        conn.truncate_table(&people(), tx).await.unwrap();
        conn.drop_table(&people(), tx).await.unwrap();
        conn.commit_transaction(tx).await.unwrap();
        assert_eq!(
            driver.log(),
            vec![
                "BEGIN",
                "DELETE FROM \"people\"",
                "DROP TABLE IF EXISTS \"people\"",
                "COMMIT",
            ]
        );
        assert!(conn.commit_transaction(tx).await.is_err());
    }
}
