//! Type and nullability checks between a reader and the writer.

use crate::ast::{Column, DeltaType, Filter, Operation, Table};
use crate::error::EtlResult;
use crate::reader::RowReader;
use crate::types::{Row, TypeCode, Value};
use async_trait::async_trait;

pub const STATUS_PASSED: &str = "passed";
pub const STATUS_REJECTED: &str = "rejected";

/// Wraps a reader and checks every tracking and non-tracking field against
/// its column definition. Failing rows come out as reject (`R`) rows with
/// the reasons in the rejected-reason column; passing rows are converted to
/// the column types.
pub struct ValidatingReader {
    inner: Box<dyn RowReader>,
    table: Table,
    /// Output ordinal for each inner ordinal.
    mapping: Vec<usize>,
    operation: usize,
    reason: usize,
    status: usize,
    rows_rejected: u64,
}

impl ValidatingReader {
    pub fn new(inner: Box<dyn RowReader>) -> EtlResult<Self> {
        let source = inner.table();
        let mut columns: Vec<Column> = source.columns().to_vec();
        let mut offset = 0;
        if source.column_by_delta(DeltaType::DatabaseOperation).is_none() {
            columns.insert(0, Column::new("Operation", TypeCode::Char).delta(DeltaType::DatabaseOperation));
            offset = 1;
        }
        if source.column_by_delta(DeltaType::RejectedReason).is_none() {
            columns.push(Column::new("RejectReason", TypeCode::String).delta(DeltaType::RejectedReason));
        }
        if source.column_by_delta(DeltaType::ValidationStatus).is_none() {
            columns.push(Column::new("ValidationStatus", TypeCode::String).delta(DeltaType::ValidationStatus));
        }
        let mapping = (0..source.len()).map(|i| i + offset).collect();
        let table = Table::with_columns(source.name.clone(), columns)?;
        // The three columns exist by construction.
        let ordinal = |delta| table.ordinal_by_delta(delta).unwrap_or_default();
        let operation = ordinal(DeltaType::DatabaseOperation);
        let reason = ordinal(DeltaType::RejectedReason);
        let status = ordinal(DeltaType::ValidationStatus);
        Ok(Self {
            inner,
            table,
            mapping,
            operation,
            reason,
            status,
            rows_rejected: 0,
        })
    }

    /// Rows turned into rejects so far.
    pub fn rows_rejected(&self) -> u64 {
        self.rows_rejected
    }

    fn validate(&mut self, source: Row) -> Row {
        let mut row = vec![Value::Null; self.table.len()];
        for (value, ordinal) in source.into_iter().zip(&self.mapping) {
            row[*ordinal] = value;
        }
        if row[self.operation].is_null() {
            row[self.operation] = Operation::Create.value();
        }

        let mut reasons = Vec::new();
        let mut converted = row.clone();
        for (i, column) in self.table.columns().iter().enumerate() {
            if !matches!(column.delta_type, DeltaType::TrackingField | DeltaType::NonTrackingField) {
                continue;
            }
            if row[i].is_null() {
                if !column.allow_db_null {
                    reasons.push(format!("Column:{}: Tried to insert null into non-null column.", column.name));
                }
                continue;
            }
            match column.convert(&row[i]) {
                Ok(value) => converted[i] = value,
                Err(e) => reasons.push(e.to_string()),
            }
        }

        if reasons.is_empty() {
            converted[self.status] = Value::from(STATUS_PASSED);
            return converted;
        }
        self.rows_rejected += 1;
        row[self.operation] = Operation::Reject.value();
        row[self.status] = Value::from(STATUS_REJECTED);
        row[self.reason] = Value::String(reasons.join("\n"));
        row
    }
}

#[async_trait]
impl RowReader for ValidatingReader {
    fn table(&self) -> &Table {
        &self.table
    }

    async fn read(&mut self) -> EtlResult<Option<Row>> {
        let Some(row) = self.inner.read().await? else {
            return Ok(None);
        };
        Ok(Some(self.validate(row)))
    }

    fn can_lookup_direct(&self) -> bool {
        self.inner.can_lookup_direct()
    }

    async fn lookup_row_direct(&mut self, filters: &[Filter]) -> EtlResult<Option<Row>> {
        Ok(self.inner.lookup_row_direct(filters).await?.map(|row| {
            let mut out = vec![Value::Null; self.table.len()];
            for (value, ordinal) in row.into_iter().zip(&self.mapping) {
                out[*ordinal] = value;
            }
            out
        }))
    }
}
