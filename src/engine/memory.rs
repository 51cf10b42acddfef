//! In-process [`Connection`] for tests, dry runs and staging.

use super::connection::{Connection, InsertOutcome};
use super::evaluate;
use super::transaction::TxHandle;
use crate::ast::{
    Aggregate, DeleteQuery, DeltaType, InsertQuery, SelectColumn, SelectQuery, Table, UpdateQuery,
};
use crate::error::{EtlError, EtlResult};
use crate::reader::{MemoryReader, RowReader};
use crate::types::{Numeric, Row, TypeCode, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct MemoryTable {
    table: Table,
    rows: Vec<Row>,
    next_identity: i64,
}

type Tables = HashMap<String, MemoryTable>;

/// State of each table a transaction touched, as it was before the first
/// change. `None` marks a table the transaction created.
type Undo = HashMap<String, Option<MemoryTable>>;

/// Tables held in memory. Rollback restores only the tables the
/// transaction changed; writes to other tables stay.
#[derive(Clone, Default)]
pub struct MemoryConnection {
    name: String,
    tables: Arc<Mutex<Tables>>,
    next_tx: Arc<AtomicI64>,
    undo: Arc<DashMap<TxHandle, Undo>>,
}

fn missing(table: &Table) -> EtlError {
    EtlError::connection(
        format!("table {}", table.qualified_name()),
        "table does not exist",
    )
}

impl MemoryConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create `table` holding `rows`, replacing any existing table.
    pub async fn load(&self, table: &Table, rows: Vec<Row>) {
        let next_identity = identity_seed(table, &rows);
        self.tables.lock().await.insert(
            table.qualified_name(),
            MemoryTable {
                table: table.clone(),
                rows,
                next_identity,
            },
        );
    }

    /// Current rows of a table, laid out by its stored definition.
    pub async fn rows(&self, table: &Table) -> EtlResult<Vec<Row>> {
        let tables = self.tables.lock().await;
        tables
            .get(&table.qualified_name())
            .map(|t| t.rows.clone())
            .ok_or_else(|| missing(table))
    }

    fn check_tx(&self, tx: TxHandle) -> EtlResult<()> {
        if tx.is_auto() || self.undo.contains_key(&tx) {
            Ok(())
        } else {
            Err(EtlError::Transaction(format!("unknown or finished transaction {}", tx)))
        }
    }

    /// Record the table under `key` before `tx` first changes it.
    fn remember(&self, tx: TxHandle, tables: &Tables, key: &str) {
        if let Some(mut undo) = self.undo.get_mut(&tx) {
            undo.entry(key.to_string())
                .or_insert_with(|| tables.get(key).cloned());
        }
    }

    /// Apply `op` to a working copy of the table and keep it only on success.
    async fn modify<T>(
        &self,
        table: &Table,
        tx: TxHandle,
        op: impl FnOnce(&mut MemoryTable) -> EtlResult<T>,
    ) -> EtlResult<T> {
        self.check_tx(tx)?;
        let mut tables = self.tables.lock().await;
        let key = table.qualified_name();
        if !tables.contains_key(&key) {
            return Err(missing(table));
        }
        self.remember(tx, &tables, &key);
        let stored = tables.get_mut(&key).ok_or_else(|| missing(table))?;
        let mut working = stored.clone();
        let result = op(&mut working)?;
        *stored = working;
        Ok(result)
    }
}

fn identity_seed(table: &Table, rows: &[Row]) -> i64 {
    let Some(ordinal) = table.ordinal_by_delta(DeltaType::DbAutoIncrement) else {
        return 1;
    };
    rows.iter()
        .filter_map(|r| r.get(ordinal).and_then(Value::as_i64))
        .max()
        .map_or(1, |max| max + 1)
}

/// Reorder a row from `source` layout into `target` layout by column name.
fn relayout(source: &Table, target: &Table, row: &Row) -> Row {
    target
        .columns()
        .iter()
        .map(|column| {
            source
                .ordinal(&column.name)
                .and_then(|i| row.get(i).cloned())
                .unwrap_or_default()
        })
        .collect()
}

fn insert_row(stored: &mut MemoryTable, mut row: Row) {
    if let Some(ordinal) = stored.table.ordinal_by_delta(DeltaType::DbAutoIncrement) {
        row[ordinal] = Value::Int(stored.next_identity);
        stored.next_identity += 1;
    }
    stored.rows.push(row);
}

fn outcome(stored: &MemoryTable, rows: u64) -> InsertOutcome {
    let has_identity = stored.table.ordinal_by_delta(DeltaType::DbAutoIncrement).is_some();
    InsertOutcome {
        rows,
        last_identity: has_identity.then_some(stored.next_identity - 1),
    }
}

fn aggregate(column: &SelectColumn, ordinal: usize, rows: &[&Row]) -> Value {
    let values = rows.iter().map(|r| &r[ordinal]).filter(|v| !v.is_null());
    match column.aggregate {
        Aggregate::None => rows.first().map(|r| r[ordinal].clone()).unwrap_or_default(),
        Aggregate::Count => Value::Int(values.count() as i64),
        Aggregate::Sum => values
            .filter_map(Numeric::from_value)
            .reduce(Numeric::add)
            .map(Numeric::into_value)
            .unwrap_or_default(),
        Aggregate::Average => {
            let mut count = 0;
            let total = values
                .filter_map(Numeric::from_value)
                .inspect(|_| count += 1)
                .fold(Numeric::zero(), Numeric::add);
            total
                .divide_by_count(count)
                .map(Numeric::into_value)
                .unwrap_or_default()
        }
        Aggregate::Min => values
            .min_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or_default(),
        Aggregate::Max => values
            .max_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or_default(),
    }
}

fn output_table(source: &Table, query: &SelectQuery) -> EtlResult<Table> {
    let mut columns = Vec::with_capacity(query.columns.len());
    for select in &query.columns {
        let mut column = select.column.copy(false);
        if let Some(name) = &select.output_name {
            column.name = name.clone();
        }
        match select.aggregate {
            Aggregate::Count => column.base_type = TypeCode::Int64,
            Aggregate::Average => column.base_type = TypeCode::Double,
            _ => {}
        }
        columns.push(column);
    }
    Table::with_columns(source.name.clone(), columns)
}

/// Evaluate a select in process: filter, group, having, sort, limit.
pub(crate) fn select(stored: &Table, rows: &[Row], query: &SelectQuery) -> EtlResult<(Table, Vec<Row>)> {
    if !query.joins.is_empty() {
        return Err(EtlError::compile("joins are not supported by the in-memory store"));
    }
    let mut matching = Vec::new();
    for row in rows {
        if evaluate::matches(stored, row, &query.filters)? {
            matching.push(row.clone());
        }
    }
    let limit = query.rows.filter(|n| *n > 0).map(|n| n as usize);

    if query.columns.is_empty() {
        evaluate::sort_rows(stored, &mut matching, &query.sorts)?;
        matching.truncate(limit.unwrap_or(usize::MAX));
        return Ok((stored.clone(), matching));
    }

    let mut ordinals = Vec::with_capacity(query.columns.len());
    for select in &query.columns {
        ordinals.push(stored.ordinal(&select.column.name).ok_or_else(|| {
            EtlError::compile(format!(
                "column '{}' is not in table '{}'",
                select.column.name, stored.name
            ))
        })?);
    }
    let output = output_table(stored, query)?;
    let grouped = !query.groups.is_empty() || query.columns.iter().any(|c| c.aggregate != Aggregate::None);

    let mut result = if grouped {
        let mut group_ordinals = Vec::with_capacity(query.groups.len());
        for column in &query.groups {
            group_ordinals.push(stored.ordinal(&column.name).ok_or_else(|| {
                EtlError::compile(format!("group column '{}' is not in table '{}'", column.name, stored.name))
            })?);
        }
        let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();
        for row in &matching {
            let key: Vec<Value> = group_ordinals.iter().map(|i| row[*i].clone()).collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        if groups.is_empty() && query.groups.is_empty() {
            groups.push((Vec::new(), Vec::new()));
        }
        let mut out = Vec::with_capacity(groups.len());
        for (_, members) in &groups {
            let row: Row = query
                .columns
                .iter()
                .zip(&ordinals)
                .map(|(select, ordinal)| aggregate(select, *ordinal, members))
                .collect();
            if evaluate::matches(&output, &row, &query.group_filters)? {
                out.push(row);
            }
        }
        out
    } else {
        matching
            .iter()
            .map(|row| ordinals.iter().map(|i| row[*i].clone()).collect())
            .collect()
    };
    let sorts: Vec<_> = query
        .sorts
        .iter()
        .map(|sort| {
            let mut sort = sort.clone();
            if let Some(select) = query.columns.iter().find(|c| c.column.name == sort.column.name)
                && let Some(name) = &select.output_name
            {
                sort.column.name = name.clone();
            }
            sort
        })
        .collect();
    evaluate::sort_rows(&output, &mut result, &sorts)?;
    result.truncate(limit.unwrap_or(usize::MAX));
    Ok((output, result))
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn table_exists(&self, table: &Table, tx: TxHandle) -> EtlResult<bool> {
        self.check_tx(tx)?;
        Ok(self.tables.lock().await.contains_key(&table.qualified_name()))
    }

    async fn create_table(&self, table: &Table, drop: bool, tx: TxHandle) -> EtlResult<()> {
        self.check_tx(tx)?;
        let mut tables = self.tables.lock().await;
        let key = table.qualified_name();
        if !drop && tables.contains_key(&key) {
            return Err(EtlError::connection(
                format!("create table {}", key),
                "table already exists",
            ));
        }
        self.remember(tx, &tables, &key);
        tables.insert(
            key,
            MemoryTable {
                table: table.clone(),
                rows: Vec::new(),
                next_identity: 1,
            },
        );
        debug!(table = %table.name, drop, "create table");
        Ok(())
    }

    async fn drop_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()> {
        self.check_tx(tx)?;
        let mut tables = self.tables.lock().await;
        let key = table.qualified_name();
        self.remember(tx, &tables, &key);
        tables.remove(&key);
        Ok(())
    }

    async fn truncate_table(&self, table: &Table, tx: TxHandle) -> EtlResult<()> {
        self.modify(table, tx, |stored| {
            stored.rows.clear();
            Ok(())
        })
        .await
    }

    async fn row_count(&self, table: &Table, query: Option<&SelectQuery>, tx: TxHandle) -> EtlResult<u64> {
        self.check_tx(tx)?;
        let tables = self.tables.lock().await;
        let stored = tables.get(&table.qualified_name()).ok_or_else(|| missing(table))?;
        let filters = query.map(|q| q.filters.as_slice()).unwrap_or_default();
        let mut count = 0;
        for row in &stored.rows {
            if evaluate::matches(&stored.table, row, filters)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn start_transaction(&self) -> EtlResult<TxHandle> {
        let handle = TxHandle(self.next_tx.fetch_add(1, Ordering::SeqCst) + 1);
        self.undo.insert(handle, Undo::new());
        Ok(handle)
    }

    async fn commit_transaction(&self, tx: TxHandle) -> EtlResult<()> {
        self.undo
            .remove(&tx)
            .map(|_| ())
            .ok_or_else(|| EtlError::Transaction(format!("unknown or finished transaction {}", tx)))
    }

    async fn rollback_transaction(&self, tx: TxHandle) -> EtlResult<()> {
        let (_, undo) = self
            .undo
            .remove(&tx)
            .ok_or_else(|| EtlError::Transaction(format!("unknown or finished transaction {}", tx)))?;
        let mut tables = self.tables.lock().await;
        for (key, before) in undo {
            match before {
                Some(table) => tables.insert(key, table),
                None => tables.remove(&key),
            };
        }
        Ok(())
    }

    async fn execute_insert_bulk(
        &self,
        table: &Table,
        rows: &[Row],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        self.modify(table, tx, |stored| {
            for row in rows {
                let row = relayout(table, &stored.table, row);
                insert_row(stored, row);
            }
            Ok(outcome(stored, rows.len() as u64))
        })
        .await
    }

    async fn execute_insert(
        &self,
        table: &Table,
        queries: &[InsertQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<InsertOutcome> {
        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        self.modify(table, tx, |stored| {
            for query in queries {
                let row = stored
                    .table
                    .columns()
                    .iter()
                    .map(|column| {
                        query
                            .columns
                            .iter()
                            .find(|qc| qc.column.name == column.name)
                            .map(|qc| qc.value.clone())
                            .unwrap_or_default()
                    })
                    .collect();
                insert_row(stored, row);
            }
            Ok(outcome(stored, queries.len() as u64))
        })
        .await
    }

    async fn execute_update(
        &self,
        table: &Table,
        queries: &[UpdateQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        self.modify(table, tx, |stored| {
            let mut updated = 0;
            for query in queries {
                let mut targets = Vec::with_capacity(query.columns.len());
                for qc in &query.columns {
                    let ordinal = stored.table.ordinal(&qc.column.name).ok_or_else(|| {
                        EtlError::compile(format!("column '{}' is not in table '{}'", qc.column.name, table.name))
                    })?;
                    targets.push((ordinal, &qc.value));
                }
                for row in stored.rows.iter_mut() {
                    if evaluate::matches(&stored.table, row, &query.filters)? {
                        for (ordinal, value) in &targets {
                            row[*ordinal] = (*value).clone();
                        }
                        updated += 1;
                    }
                }
            }
            Ok(updated)
        })
        .await
    }

    async fn execute_delete(
        &self,
        table: &Table,
        queries: &[DeleteQuery],
        tx: TxHandle,
        cancel: &CancellationToken,
    ) -> EtlResult<u64> {
        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        self.modify(table, tx, |stored| {
            let mut deleted = 0;
            for query in queries {
                let mut kept = Vec::with_capacity(stored.rows.len());
                for row in stored.rows.drain(..) {
                    if evaluate::matches(&stored.table, &row, &query.filters)? {
                        deleted += 1;
                    } else {
                        kept.push(row);
                    }
                }
                stored.rows = kept;
            }
            Ok(deleted)
        })
        .await
    }

    async fn execute_scalar(&self, table: &Table, query: &SelectQuery, tx: TxHandle) -> EtlResult<Value> {
        self.check_tx(tx)?;
        let tables = self.tables.lock().await;
        let stored = tables.get(&table.qualified_name()).ok_or_else(|| missing(table))?;
        let (_, rows) = select(&stored.table, &stored.rows, query)?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or_default())
    }

    async fn reader(&self, table: &Table, query: Option<SelectQuery>) -> EtlResult<Box<dyn RowReader>> {
        let tables = self.tables.lock().await;
        let stored = tables.get(&table.qualified_name()).ok_or_else(|| missing(table))?;
        let query = query.unwrap_or_default();
        let (output, rows) = select(&stored.table, &stored.rows, &query)?;
        Ok(Box::new(MemoryReader::new(output, rows)))
    }
}
