//! Batched, ordered writes of classified rows into a target table.
//!
//! Rows are routed into one of four batches (create, update, delete,
//! reject). A full batch is flushed on its own tokio task while the caller
//! keeps feeding rows. At most one flush per operation is in flight, and a
//! flush first waits for the flushes it depends on:
//!
//! | flush  | waits for                  |
//! |--------|----------------------------|
//! | create | create                     |
//! | update | create, update             |
//! | delete | create, update, delete     |
//! | reject | reject                     |

pub mod target;

pub use target::WriterTarget;

use crate::ast::{
    Aggregate, Column, Compare, DeleteQuery, DeltaType, Filter, Operation, QueryColumn,
    SelectColumn, SelectQuery, Table, UpdateQuery,
};
use crate::engine::{Connection, TxHandle};
use crate::error::{EtlError, EtlResult};
use crate::reader::RowReader;
use crate::types::{Row, TypeCode, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_COMMIT_SIZE: usize = 10_000;

/// What `open` does to the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetAction {
    /// Use the table as it is.
    None,
    /// Create the table when it does not exist.
    #[default]
    Create,
    /// Drop and recreate the table.
    DropCreate,
    /// Empty the table, creating it when it does not exist.
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Rows per batch before a flush is started.
    pub commit_size: usize,
    /// Caller-managed transaction; [`TxHandle::AUTO`] commits every flush.
    #[serde(skip)]
    pub transaction: TxHandle,
    pub target_action: TargetAction,
    /// Appended to the target name to name the default reject table.
    pub reject_table_suffix: String,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            commit_size: DEFAULT_COMMIT_SIZE,
            transaction: TxHandle::AUTO,
            target_action: TargetAction::default(),
            reject_table_suffix: "_reject".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Initialized,
    Started,
    Running,
    Finished,
    Abended,
    Cancelled,
}

/// Outcome of a write. Errors are reported here, never returned.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WriterResult {
    pub table: String,
    pub rows_read: u64,
    pub rows_created: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub rows_rejected: u64,
    pub status: RunStatus,
    pub message: Option<String>,
    pub children: Vec<WriterResult>,
}

impl WriterResult {
    pub fn rows_written(&self) -> u64 {
        self.rows_created + self.rows_updated + self.rows_deleted
    }
}

/// A completed flush.
#[derive(Debug)]
pub struct FlushReport {
    pub operation: Operation,
    /// The flushed rows, in target layout and batch order.
    pub rows: Vec<Row>,
    /// Rows the store reported as affected.
    pub affected: u64,
    /// Highest database identity after a create flush.
    pub last_identity: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Open,
    Writing,
    Closing,
}

fn slot(operation: Operation) -> usize {
    match operation {
        Operation::Create => 0,
        Operation::Update => 1,
        Operation::Delete => 2,
        Operation::Reject => 3,
    }
}

fn dependencies(operation: Operation) -> &'static [Operation] {
    match operation {
        Operation::Create => &[Operation::Create],
        Operation::Update => &[Operation::Create, Operation::Update],
        Operation::Delete => &[Operation::Create, Operation::Update, Operation::Delete],
        Operation::Reject => &[Operation::Reject],
    }
}

/// Where reject rows go. The table is created on first use.
struct RejectTarget {
    connection: Arc<dyn Connection>,
    table: Table,
    ready: OnceCell<()>,
}

impl RejectTarget {
    async fn ensure(&self, tx: TxHandle) -> EtlResult<()> {
        self.ready
            .get_or_try_init(|| async {
                if !self.connection.table_exists(&self.table, tx).await? {
                    self.connection.create_table(&self.table, false, tx).await?;
                }
                Ok::<(), EtlError>(())
            })
            .await?;
        Ok(())
    }
}

/// Reject table layout: the target's columns, nullable and untyped, plus a
/// rejected-reason column.
pub fn reject_table(target: &Table, suffix: &str) -> EtlResult<Table> {
    let mut columns: Vec<Column> = target
        .columns()
        .iter()
        .filter(|c| !c.is_parent())
        .map(|c| {
            let mut column = c.copy(false);
            if column.delta_type != DeltaType::DbAutoIncrement {
                column.base_type = TypeCode::String;
                column.base_max_length = None;
                column.allow_db_null = true;
                column.is_unique = false;
            }
            column
        })
        .collect();
    if target.column_by_delta(DeltaType::RejectedReason).is_none() {
        columns.push(Column::new("RejectReason", TypeCode::String).delta(DeltaType::RejectedReason));
    }
    Table::with_columns(format!("{}{}", target.name, suffix), columns)
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    read: u64,
    created: u64,
    updated: u64,
    deleted: u64,
    rejected: u64,
}

/// Classifies rows and flushes them in ordered batches.
pub struct TransformWriter {
    state: WriterState,
    connection: Arc<dyn Connection>,
    table: Arc<Table>,
    options: WriterOptions,
    cancel: CancellationToken,
    reject: Option<Arc<RejectTarget>>,
    reject_override: Option<(Option<Table>, Option<Arc<dyn Connection>>)>,
    /// For each target column, the input ordinal feeding it.
    mapping: Vec<Option<usize>>,
    reject_mapping: Vec<Option<usize>>,
    defaults: Vec<Value>,
    operation_ordinal: Option<usize>,
    reason_ordinal: Option<usize>,
    /// Target ordinal and next value of an in-process auto-increment column.
    auto_increment: Option<(usize, i64)>,
    batches: [Vec<Row>; 4],
    tasks: [Option<JoinHandle<EtlResult<FlushReport>>>; 4],
    /// Await create flushes inline and hand their report to the caller.
    sync_creates: bool,
    counts: Counts,
}

impl TransformWriter {
    pub fn new(connection: Arc<dyn Connection>, table: Table, options: WriterOptions) -> Self {
        Self {
            state: WriterState::Idle,
            connection,
            table: Arc::new(table),
            options,
            cancel: CancellationToken::new(),
            reject: None,
            reject_override: None,
            mapping: Vec::new(),
            reject_mapping: Vec::new(),
            defaults: Vec::new(),
            operation_ordinal: None,
            reason_ordinal: None,
            auto_increment: None,
            batches: Default::default(),
            tasks: Default::default(),
            sync_creates: false,
            counts: Counts::default(),
        }
    }

    /// Send rejects to `table` on `connection` instead of the default
    /// `<target><suffix>` table on the target connection.
    pub fn with_reject(mut self, table: Option<Table>, connection: Option<Arc<dyn Connection>>) -> Self {
        self.reject_override = Some((table, connection));
        self
    }

    pub(crate) fn set_sync_creates(&mut self, sync: bool) {
        self.sync_creates = sync;
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Prepare the target for rows laid out as `input`.
    pub async fn open(&mut self, input: &Table, cancel: CancellationToken) -> EtlResult<()> {
        if self.state != WriterState::Idle {
            return Err(EtlError::Protocol(format!(
                "writer for '{}' is already open",
                self.table.name
            )));
        }
        self.cancel = cancel;
        self.counts = Counts::default();
        let tx = self.options.transaction;

        self.operation_ordinal = input.ordinal_by_delta(DeltaType::DatabaseOperation);
        self.reason_ordinal = input.ordinal_by_delta(DeltaType::RejectedReason);
        self.mapping = map_columns(&self.table, input);
        self.defaults = self
            .table
            .columns()
            .iter()
            .map(|c| c.typed_default().map(Option::unwrap_or_default))
            .collect::<EtlResult<_>>()?;

        match self.options.target_action {
            TargetAction::None => {}
            TargetAction::Create => {
                if !self.connection.table_exists(&self.table, tx).await? {
                    self.connection.create_table(&self.table, false, tx).await?;
                }
            }
            TargetAction::DropCreate => self.connection.create_table(&self.table, true, tx).await?,
            TargetAction::Truncate => {
                if self.connection.table_exists(&self.table, tx).await? {
                    self.connection.truncate_table(&self.table, tx).await?;
                } else {
                    self.connection.create_table(&self.table, false, tx).await?;
                }
            }
        }

        let (table, connection) = self.reject_override.clone().unwrap_or((None, None));
        let reject_table = match table {
            Some(table) => table,
            None => reject_table(&self.table, &self.options.reject_table_suffix)?,
        };
        self.reject_mapping = map_columns(&reject_table, input);
        if let Some(reason) = self.reason_ordinal
            && let Some(target) = reject_table.ordinal_by_delta(DeltaType::RejectedReason)
        {
            self.reject_mapping[target] = Some(reason);
        }
        self.reject = Some(Arc::new(RejectTarget {
            connection: connection.unwrap_or_else(|| Arc::clone(&self.connection)),
            table: reject_table,
            ready: OnceCell::new(),
        }));

        self.auto_increment = match self.table.ordinal_by_delta(DeltaType::AutoIncrement) {
            Some(ordinal) => {
                let column = self.table.columns()[ordinal].clone();
                let query = SelectQuery::new().column(SelectColumn::aggregate(column, Aggregate::Max));
                let max = self.connection.execute_scalar(&self.table, &query, tx).await?;
                Some((ordinal, max.as_i64().unwrap_or(0) + 1))
            }
            None => None,
        };

        debug!(table = %self.table.name, "writer open");
        self.state = WriterState::Open;
        Ok(())
    }

    /// Classify an input row and lay it out for its destination table.
    pub fn prepare(&mut self, row: &Row) -> EtlResult<(Operation, Row)> {
        if !matches!(self.state, WriterState::Open | WriterState::Writing) {
            return Err(EtlError::Protocol(format!(
                "writer for '{}' is not open",
                self.table.name
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        self.state = WriterState::Writing;
        self.counts.read += 1;

        let operation = match self.operation_ordinal {
            Some(ordinal) => {
                let value = row.get(ordinal).unwrap_or(&Value::Null);
                Operation::from_value("operation", value)?
            }
            None => Operation::Create,
        };

        if operation == Operation::Reject {
            let out = self
                .reject_mapping
                .iter()
                .map(|source| source.and_then(|i| row.get(i).cloned()).unwrap_or_default())
                .collect();
            return Ok((operation, out));
        }

        if matches!(operation, Operation::Update | Operation::Delete) && self.table.key_columns().is_empty() {
            return Err(EtlError::Config(format!(
                "table '{}' has no key columns to match {} rows",
                self.table.name, operation
            )));
        }

        let mut out = Vec::with_capacity(self.table.len());
        for (i, column) in self.table.columns().iter().enumerate() {
            let value = match self.mapping[i] {
                Some(source) => row.get(source).cloned().unwrap_or_default(),
                None => self.defaults[i].clone(),
            };
            out.push(if value.is_null() || column.is_parent() {
                value
            } else {
                column.convert(&value)?
            });
        }
        if operation == Operation::Create
            && let Some((ordinal, next)) = self.auto_increment.as_mut()
        {
            out[*ordinal] = Value::Int(*next);
            *next += 1;
        }
        Ok((operation, out))
    }

    /// Add a prepared row to its batch, flushing when the batch is full.
    pub async fn push(&mut self, operation: Operation, row: Row) -> EtlResult<Option<FlushReport>> {
        self.batches[slot(operation)].push(row);
        if self.batches[slot(operation)].len() >= self.options.commit_size.max(1) {
            return self.flush(operation).await;
        }
        Ok(None)
    }

    pub async fn write_row(&mut self, row: &Row) -> EtlResult<Option<FlushReport>> {
        let (operation, row) = self.prepare(row)?;
        self.push(operation, row).await
    }

    async fn flush(&mut self, operation: Operation) -> EtlResult<Option<FlushReport>> {
        if self.batches[slot(operation)].is_empty() {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        for dependency in dependencies(operation) {
            self.await_task(*dependency).await?;
        }
        let rows = std::mem::take(&mut self.batches[slot(operation)]);
        debug!(table = %self.table.name, %operation, rows = rows.len(), "flush");

        let job = FlushJob {
            operation,
            rows,
            connection: Arc::clone(&self.connection),
            table: Arc::clone(&self.table),
            reject: self.reject.clone(),
            tx: self.options.transaction,
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(job.run());
        if self.sync_creates && operation == Operation::Create {
            let report = join(handle).await?;
            self.fold(&report);
            return Ok(Some(report));
        }
        self.tasks[slot(operation)] = Some(handle);
        Ok(None)
    }

    async fn await_task(&mut self, operation: Operation) -> EtlResult<()> {
        if let Some(handle) = self.tasks[slot(operation)].take() {
            let report = join(handle).await?;
            self.fold(&report);
        }
        Ok(())
    }

    fn fold(&mut self, report: &FlushReport) {
        let count = match report.operation {
            Operation::Create => &mut self.counts.created,
            Operation::Update => &mut self.counts.updated,
            Operation::Delete => &mut self.counts.deleted,
            Operation::Reject => &mut self.counts.rejected,
        };
        *count += report.affected;
    }

    /// Flush what is left in order create, update, delete, reject and wait
    /// for every flush. Returns the last create report in sync mode.
    pub async fn close(&mut self) -> EtlResult<Option<FlushReport>> {
        if !matches!(self.state, WriterState::Open | WriterState::Writing) {
            return Err(EtlError::Protocol(format!(
                "writer for '{}' is not open",
                self.table.name
            )));
        }
        self.state = WriterState::Closing;
        let result = self.finish().await;
        if result.is_err() {
            self.abort().await;
        }
        self.state = WriterState::Idle;
        result
    }

    async fn finish(&mut self) -> EtlResult<Option<FlushReport>> {
        let mut create_report = None;
        for operation in Operation::ALL {
            if let Some(report) = self.flush(operation).await? {
                create_report = Some(report);
            }
        }
        for operation in Operation::ALL {
            self.await_task(operation).await?;
        }
        Ok(create_report)
    }

    /// Stop after a failure: drop buffered rows and wait for in-flight
    /// flushes, keeping the counts of those that succeed.
    pub async fn abort(&mut self) {
        for batch in self.batches.iter_mut() {
            batch.clear();
        }
        for operation in Operation::ALL {
            if let Some(handle) = self.tasks[slot(operation)].take() {
                match join(handle).await {
                    Ok(report) => self.fold(&report),
                    Err(e) => debug!(table = %self.table.name, %operation, error = %e, "in-flight flush failed"),
                }
            }
        }
        self.state = WriterState::Idle;
    }

    /// Counts so far, under the given status.
    pub fn result(&self, status: RunStatus, message: Option<String>) -> WriterResult {
        WriterResult {
            table: self.table.name.clone(),
            rows_read: self.counts.read,
            rows_created: self.counts.created,
            rows_updated: self.counts.updated,
            rows_deleted: self.counts.deleted,
            rows_rejected: self.counts.rejected,
            status,
            message,
            children: Vec::new(),
        }
    }
}

/// Target ordinal → input ordinal, by column name.
fn map_columns(target: &Table, input: &Table) -> Vec<Option<usize>> {
    target
        .columns()
        .iter()
        .map(|column| input.ordinal(&column.name))
        .collect()
}

async fn join(handle: JoinHandle<EtlResult<FlushReport>>) -> EtlResult<FlushReport> {
    handle
        .await
        .map_err(|e| EtlError::Protocol(format!("flush task failed: {}", e)))?
}

/// Everything a flush task needs, owned.
struct FlushJob {
    operation: Operation,
    rows: Vec<Row>,
    connection: Arc<dyn Connection>,
    table: Arc<Table>,
    reject: Option<Arc<RejectTarget>>,
    tx: TxHandle,
    cancel: CancellationToken,
}

impl FlushJob {
    async fn run(self) -> EtlResult<FlushReport> {
        let table = self.table.as_ref();
        let (affected, last_identity) = match self.operation {
            Operation::Create => {
                let outcome = self
                    .connection
                    .execute_insert_bulk(table, &self.rows, self.tx, &self.cancel)
                    .await?;
                (outcome.rows, outcome.last_identity)
            }
            Operation::Update => {
                let queries = self
                    .rows
                    .iter()
                    .map(|row| update_query(table, row))
                    .collect::<Vec<_>>();
                let updated = self
                    .connection
                    .execute_update(table, &queries, self.tx, &self.cancel)
                    .await?;
                (updated, None)
            }
            Operation::Delete => {
                let queries = self
                    .rows
                    .iter()
                    .map(|row| DeleteQuery {
                        filters: key_filters(table, row),
                    })
                    .collect::<Vec<_>>();
                let deleted = self
                    .connection
                    .execute_delete(table, &queries, self.tx, &self.cancel)
                    .await?;
                (deleted, None)
            }
            Operation::Reject => {
                let reject = self
                    .reject
                    .as_ref()
                    .ok_or_else(|| EtlError::Protocol("reject target is not open".into()))?;
                reject.ensure(self.tx).await?;
                let outcome = reject
                    .connection
                    .execute_insert_bulk(&reject.table, &self.rows, self.tx, &self.cancel)
                    .await?;
                (outcome.rows, None)
            }
        };
        Ok(FlushReport {
            operation: self.operation,
            rows: self.rows,
            affected,
            last_identity,
        })
    }
}

fn key_filters(table: &Table, row: &Row) -> Vec<Filter> {
    table
        .key_columns()
        .into_iter()
        .map(|key| {
            let value = table
                .ordinal(&key.name)
                .and_then(|i| row.get(i).cloned())
                .unwrap_or_default();
            Filter::value(key.clone(), Compare::Equal, value)
        })
        .collect()
}

fn update_query(table: &Table, row: &Row) -> UpdateQuery {
    let keys: Vec<&str> = table.key_columns().into_iter().map(|c| c.name.as_str()).collect();
    let columns = table
        .columns()
        .iter()
        .zip(row)
        .filter(|(c, _)| {
            !keys.contains(&c.name.as_str())
                && !c.is_parent()
                && !matches!(c.delta_type, DeltaType::DbAutoIncrement | DeltaType::IgnoreField)
        })
        .map(|(c, v)| QueryColumn::new(c.clone(), v.clone()))
        .collect();
    UpdateQuery {
        columns,
        filters: key_filters(table, row),
    }
}

/// Read every row from `reader` into `table` on `connection`.
///
/// Failures and cancellation are reported in the result's status.
pub async fn write_all_records(
    reader: &mut dyn RowReader,
    table: Table,
    connection: Arc<dyn Connection>,
    reject_table: Option<Table>,
    reject_connection: Option<Arc<dyn Connection>>,
    options: WriterOptions,
    cancel: CancellationToken,
) -> WriterResult {
    let writer = TransformWriter::new(connection, table, options).with_reject(reject_table, reject_connection);
    WriterTarget::from_writer(writer).write_records(reader, cancel).await
}

pub(crate) fn log_result(result: &WriterResult) {
    match result.status {
        RunStatus::Abended => warn!(
            table = %result.table,
            message = result.message.as_deref().unwrap_or_default(),
            "write abended"
        ),
        _ => tracing::info!(
            table = %result.table,
            status = ?result.status,
            read = result.rows_read,
            created = result.rows_created,
            updated = result.rows_updated,
            deleted = result.rows_deleted,
            rejected = result.rows_rejected,
            "write complete"
        ),
    }
}

#[cfg(test)]
mod tests;
