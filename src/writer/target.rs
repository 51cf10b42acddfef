//! A writer plus the writers of its nested child tables.
//!
//! Child rows arrive inside a parent column as [`Value::Rows`]. They are
//! detached from the parent row and held until the parent's key is known:
//! for created parents that is after their create flush, so database
//! identities can be read back.

use super::{FlushReport, RunStatus, TransformWriter, WriterOptions, WriterResult, log_result};
use crate::ast::{DeltaType, Operation, Table};
use crate::engine::Connection;
use crate::error::{EtlError, EtlResult};
use crate::reader::RowReader;
use crate::types::{Row, Value};
use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct ParentKey {
    ordinal: usize,
    name: String,
    /// Assigned by the database on insert.
    database: bool,
}

pub struct WriterTarget {
    writer: TransformWriter,
    /// Name of the parent input column holding this target's rows.
    path: Option<String>,
    children: Vec<WriterTarget>,
    /// Parent input ordinal of each child's rows.
    child_ordinals: Vec<usize>,
    /// Child rows of buffered parent creates, in batch order.
    pending: VecDeque<Vec<Vec<Row>>>,
    key: Option<ParentKey>,
}

impl WriterTarget {
    pub fn new(connection: Arc<dyn Connection>, table: Table, options: WriterOptions) -> Self {
        Self::from_writer(TransformWriter::new(connection, table, options))
    }

    pub fn from_writer(writer: TransformWriter) -> Self {
        Self {
            writer,
            path: None,
            children: Vec::new(),
            child_ordinals: Vec::new(),
            pending: VecDeque::new(),
            key: None,
        }
    }

    /// Attach `child` under a dotted path of parent columns, e.g.
    /// `orders.items` for items nested in orders nested in this target.
    pub fn add(&mut self, mut child: WriterTarget, path: &str) -> EtlResult<()> {
        match path.split_once('.') {
            None => {
                child.path = Some(path.to_string());
                self.children.push(child);
                Ok(())
            }
            Some((head, rest)) => {
                let parent = self
                    .children
                    .iter_mut()
                    .find(|c| c.path.as_deref() == Some(head))
                    .ok_or_else(|| EtlError::Config(format!("no child target at '{}'", head)))?;
                parent.add(child, rest)
            }
        }
    }

    fn open<'a>(&'a mut self, input: &'a Table, cancel: CancellationToken) -> BoxFuture<'a, EtlResult<()>> {
        async move {
            self.writer.set_sync_creates(!self.children.is_empty());
            self.writer.open(input, cancel.clone()).await?;
            if self.children.is_empty() {
                return Ok(());
            }

            let table = self.writer.table();
            let key = table.key_columns().first().map(|c| c.name.clone()).ok_or_else(|| {
                EtlError::Config(format!("table '{}' has child tables but no key column", table.name))
            })?;
            self.key = table.ordinal(&key).map(|ordinal| ParentKey {
                ordinal,
                database: table.columns()[ordinal].delta_type == DeltaType::DbAutoIncrement,
                name: key,
            });

            self.child_ordinals.clear();
            for child in self.children.iter_mut() {
                let path = child.path.clone().unwrap_or_default();
                let ordinal = input.ordinal(&path).ok_or_else(|| {
                    EtlError::Config(format!("input '{}' has no column '{}'", input.name, path))
                })?;
                let nested = input.columns()[ordinal]
                    .child_columns
                    .as_deref()
                    .cloned()
                    .unwrap_or_default();
                let child_input = Table::with_columns(path, nested)?;
                child.open(&child_input, cancel.clone()).await?;
                self.child_ordinals.push(ordinal);
            }
            Ok(())
        }
        .boxed()
    }

    fn write_row(&mut self, mut row: Row, parent_key: Option<(String, Value)>) -> BoxFuture<'_, EtlResult<()>> {
        async move {
            let nested: Vec<Vec<Row>> = self
                .child_ordinals
                .iter()
                .map(|&i| match row.get_mut(i).map(std::mem::take) {
                    Some(Value::Rows(rows)) => rows,
                    _ => Vec::new(),
                })
                .collect();

            let (operation, mut out) = self.writer.prepare(&row)?;
            if operation != Operation::Reject
                && let Some((name, value)) = parent_key
                && let Some(i) = self.writer.table().ordinal(&name)
            {
                out[i] = value;
            }

            if !self.children.is_empty() {
                match operation {
                    Operation::Create => self.pending.push_back(nested),
                    Operation::Update | Operation::Delete => {
                        if let Some(key) = self.key.clone() {
                            let value = out[key.ordinal].clone();
                            self.propagate(nested, &key.name, value).await?;
                        }
                    }
                    Operation::Reject => {}
                }
            }

            if let Some(report) = self.writer.push(operation, out).await? {
                self.resolve(report).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Pair a create flush with the pending child rows and release them.
    async fn resolve(&mut self, report: FlushReport) -> EtlResult<()> {
        let Some(key) = self.key.clone() else {
            return Ok(());
        };
        let count = report.rows.len() as i64;
        for (i, row) in report.rows.iter().enumerate() {
            let nested = self.pending.pop_front().unwrap_or_default();
            let value = if key.database {
                let last = report.last_identity.ok_or_else(|| {
                    EtlError::Protocol(format!("no identity returned for '{}'", self.writer.table().name))
                })?;
                Value::Int(last - count + 1 + i as i64)
            } else {
                row.get(key.ordinal).cloned().unwrap_or_default()
            };
            self.propagate(nested, &key.name, value).await?;
        }
        Ok(())
    }

    async fn propagate(&mut self, nested: Vec<Vec<Row>>, key: &str, value: Value) -> EtlResult<()> {
        for (child, rows) in self.children.iter_mut().zip(nested) {
            for row in rows {
                child.write_row(row, Some((key.to_string(), value.clone()))).await?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> BoxFuture<'_, EtlResult<()>> {
        async move {
            if let Some(report) = self.writer.close().await? {
                self.resolve(report).await?;
            }
            for child in self.children.iter_mut() {
                child.close().await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn abort(&mut self) -> BoxFuture<'_, ()> {
        async move {
            self.writer.abort().await;
            self.pending.clear();
            for child in self.children.iter_mut() {
                child.abort().await;
            }
        }
        .boxed()
    }

    fn result(&self, status: RunStatus, message: Option<String>) -> WriterResult {
        let mut result = self.writer.result(status, message);
        result.children = self.children.iter().map(|c| c.result(status, None)).collect();
        result
    }

    async fn run(&mut self, reader: &mut dyn RowReader, cancel: CancellationToken) -> EtlResult<()> {
        let input = reader.table().clone();
        self.open(&input, cancel.clone()).await?;
        while let Some(row) = reader.read().await? {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            self.write_row(row, None).await?;
        }
        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        self.close().await
    }

    /// Write every row from `reader` and report the outcome for this target
    /// and its children.
    pub async fn write_records(&mut self, reader: &mut dyn RowReader, cancel: CancellationToken) -> WriterResult {
        let result = match self.run(reader, cancel).await {
            Ok(()) => self.result(RunStatus::Finished, None),
            Err(e) => {
                self.abort().await;
                let status = if e.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Abended
                };
                self.result(status, Some(e.to_string()))
            }
        };
        log_result(&result);
        result
    }
}
