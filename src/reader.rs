//! Row sources consumed by the writer.

use crate::ast::{Aggregate, Column, DeltaType, Filter, SelectQuery, Table};
use crate::engine::driver::{Command, Driver, RowStream};
use crate::engine::evaluate;
use crate::error::{EtlError, EtlResult};
use crate::transpiler::{self, Dialect};
use crate::types::{Row, TypeCode};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Pull-based row source. Rows are laid out by [`RowReader::table`] ordinals.
#[async_trait]
pub trait RowReader: Send {
    fn table(&self) -> &Table;

    /// Next row, `None` at end of stream.
    async fn read(&mut self) -> EtlResult<Option<Row>>;

    /// Whether `lookup_row_direct` can answer without a full scan.
    fn can_lookup_direct(&self) -> bool {
        false
    }

    /// First row matching `filters`.
    async fn lookup_row_direct(&mut self, filters: &[Filter]) -> EtlResult<Option<Row>>;
}

/// Reads the result of a compiled select from a [`Driver`] cursor.
pub struct SqlReader {
    driver: Arc<dyn Driver>,
    dialect: Dialect,
    source: Table,
    query: SelectQuery,
    timeout: Option<Duration>,
    /// Output layout, one column per selected field.
    table: Table,
    /// The output columns under their source names, for in-process filters.
    filter_table: Table,
    skipped: Vec<Filter>,
    stream: RowStream,
}

impl SqlReader {
    /// Compile the query and start streaming its rows.
    pub async fn open(
        driver: Arc<dyn Driver>,
        dialect: Dialect,
        source: Table,
        query: Option<SelectQuery>,
        timeout: Option<Duration>,
    ) -> EtlResult<Self> {
        let query = query.unwrap_or_default();
        let compiled = transpiler::compile(&source, Some(&query), &dialect)?;
        let (table, filter_table) = output_tables(&source, &query, &compiled.fields)?;
        let skipped = compiled.skipped_filters.clone();
        for filter in &skipped {
            for column in [&filter.left_column, &filter.right_column].into_iter().flatten() {
                if filter_table.ordinal(&column.name).is_none() {
                    return Err(EtlError::compile(format!(
                        "filter on '{}' cannot be applied: the column is not selected",
                        column.name
                    )));
                }
            }
        }
        if !skipped.is_empty() {
            debug!(table = %source.name, count = skipped.len(), "applying filters in process");
        }
        let stream = driver
            .stream(Command::from(compiled).with_timeout(timeout))
            .await?;
        Ok(Self {
            driver,
            dialect,
            source,
            query,
            timeout,
            table,
            filter_table,
            skipped,
            stream,
        })
    }

    fn convert(&self, row: Row) -> EtlResult<Row> {
        if row.len() != self.table.len() {
            return Err(EtlError::Protocol(format!(
                "reader for '{}' expected {} fields, got {}",
                self.source.name,
                self.table.len(),
                row.len()
            )));
        }
        row.iter()
            .zip(self.table.columns())
            .map(|(value, column)| column.convert(value))
            .collect()
    }

    fn accept(&self, row: &Row) -> EtlResult<bool> {
        if self.skipped.is_empty() {
            return Ok(true);
        }
        evaluate::matches(&self.filter_table, row, &self.skipped)
    }
}

/// Output columns for the selected fields, plus the same columns named by
/// their source column.
fn output_tables(source: &Table, query: &SelectQuery, fields: &[String]) -> EtlResult<(Table, Table)> {
    let selected: Vec<(Column, Aggregate)> = if query.columns.is_empty() {
        source
            .columns()
            .iter()
            .filter(|c| c.delta_type != DeltaType::IgnoreField && !c.is_parent())
            .map(|c| (c.clone(), Aggregate::None))
            .collect()
    } else {
        query
            .columns
            .iter()
            .map(|sc| (sc.column.clone(), sc.aggregate))
            .collect()
    };

    let mut table = Table::new(source.name.clone());
    let mut filter_table = Table::new(source.name.clone());
    for ((column, aggregate), field) in selected.into_iter().zip(fields) {
        let mut output = column.copy(false);
        output.name = field.clone();
        output.reference_table = None;
        match aggregate {
            Aggregate::Count => output.base_type = TypeCode::Int64,
            Aggregate::Average => output.base_type = TypeCode::Double,
            _ => {}
        }
        let mut by_source = output.clone();
        by_source.name = column.name.clone();
        table.add_column(output)?;
        // Joined tables may share column names; the first one wins.
        if filter_table.ordinal(&by_source.name).is_none() {
            filter_table.add_column(by_source)?;
        }
    }
    Ok((table, filter_table))
}

#[async_trait]
impl RowReader for SqlReader {
    fn table(&self) -> &Table {
        &self.table
    }

    async fn read(&mut self) -> EtlResult<Option<Row>> {
        while let Some(next) = self.stream.next().await {
            let row = self.convert(next?)?;
            if self.accept(&row)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn can_lookup_direct(&self) -> bool {
        true
    }

    async fn lookup_row_direct(&mut self, filters: &[Filter]) -> EtlResult<Option<Row>> {
        let mut query = self.query.clone();
        query.filters = filters.to_vec();
        query.sorts.clear();
        if filters.iter().all(|f| transpiler::is_filter_supported(f, &self.dialect)) {
            query.rows = Some(1);
        }
        let compiled = transpiler::compile(&self.source, Some(&query), &self.dialect)?;
        let skipped = compiled.skipped_filters.clone();
        let mut session = self.driver.open().await?;
        let rows = session
            .query(&Command::from(compiled).with_timeout(self.timeout))
            .await?;
        for row in rows {
            let row = self.convert(row)?;
            if evaluate::matches(&self.filter_table, &row, &skipped)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Rows held in memory, already filtered, sorted and projected.
pub struct MemoryReader {
    table: Table,
    rows: Vec<Row>,
    pending: VecDeque<Row>,
}

impl MemoryReader {
    pub fn new(table: Table, rows: Vec<Row>) -> Self {
        Self {
            table,
            pending: rows.iter().cloned().collect(),
            rows,
        }
    }
}

#[async_trait]
impl RowReader for MemoryReader {
    fn table(&self) -> &Table {
        &self.table
    }

    async fn read(&mut self) -> EtlResult<Option<Row>> {
        Ok(self.pending.pop_front())
    }

    fn can_lookup_direct(&self) -> bool {
        true
    }

    async fn lookup_row_direct(&mut self, filters: &[Filter]) -> EtlResult<Option<Row>> {
        for row in &self.rows {
            if evaluate::matches(&self.table, row, filters)? {
                return Ok(Some(row.clone()));
            }
        }
        Ok(None)
    }
}

/// Drain a reader into memory.
pub async fn read_all(reader: &mut dyn RowReader) -> EtlResult<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(row) = reader.read().await? {
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Compare, SelectColumn};
    use crate::testing::RecordingDriver;
    use crate::types::Value;

    fn docs() -> Table {
        Table::with_columns(
            "docs",
            vec![
                Column::new("id", TypeCode::Int64),
                Column::new("tags", TypeCode::String).array(1),
                Column::new("score", TypeCode::Decimal),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sql_reader_converts_and_applies_skipped_filters() {
        let driver = RecordingDriver::default().with_rows(vec![
            vec![Value::Int(1), Value::Array(vec!["rust".into()]), "1.5".into()],
            vec![Value::Int(2), Value::Array(vec!["go".into()]), "2".into()],
        ]);
        let table = docs();
        let query = SelectQuery::new().filter(Filter::value(
            table.column("tags").unwrap().clone(),
            Compare::Equal,
            "rust",
        ));
        let mut reader = SqlReader::open(Arc::new(driver.clone()), Dialect::postgres(), table, Some(query), None)
            .await
            .unwrap();
        let row = reader.read().await.unwrap().unwrap();
        assert_eq!(row[0], Value::Int(1));
        assert_eq!(row[2], Value::Decimal("1.5".parse().unwrap()));
        assert!(reader.read().await.unwrap().is_none());
        assert_eq!(
            driver.log(),
            vec!["SELECT \"id\", \"tags\", \"score\" FROM \"docs\""]
        );
    }

    #[tokio::test]
    async fn test_sql_reader_keeps_or_branch_of_skipped_filter() {
        let driver = RecordingDriver::default().with_rows(vec![
            vec![Value::Int(1), Value::Array(vec!["go".into()]), Value::Null],
            vec![Value::Int(2), Value::Array(vec!["go".into()]), Value::Null],
            vec![Value::Int(3), Value::Array(vec!["rust".into()]), Value::Null],
        ]);
        let table = docs();
        let query = SelectQuery::new()
            .filter(Filter::value(table.column("tags").unwrap().clone(), Compare::Equal, "rust").or())
            .filter(Filter::value(table.column("id").unwrap().clone(), Compare::Equal, 1));
        let mut reader = SqlReader::open(Arc::new(driver.clone()), Dialect::postgres(), table, Some(query), None)
            .await
            .unwrap();
        let ids: Vec<Value> = read_all(&mut reader)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row[0].clone())
            .collect();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(
            driver.log(),
            vec!["SELECT \"id\", \"tags\", \"score\" FROM \"docs\""]
        );
    }

    #[tokio::test]
    async fn test_sql_reader_conversion_error_names_column() {
        let driver = RecordingDriver::default().with_rows(vec![vec![
            "abc".into(),
            Value::Null,
            Value::Null,
        ]]);
        let mut reader = SqlReader::open(Arc::new(driver), Dialect::sqlite(), docs(), None, None)
            .await
            .unwrap();
        match reader.read().await.unwrap_err() {
            EtlError::Conversion { column, type_code, .. } => {
                assert_eq!(column, "id");
                assert_eq!(type_code, TypeCode::Int64);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_output_table_uses_field_names() {
        let driver = RecordingDriver::default().with_rows(vec![vec![Value::Int(3)]]);
        let table = docs();
        let query = SelectQuery::new()
            .column(SelectColumn::aggregate(table.column("id").unwrap().clone(), Aggregate::Count).named("n"));
        let mut reader = SqlReader::open(Arc::new(driver), Dialect::sqlite(), table, Some(query), None)
            .await
            .unwrap();
        assert_eq!(reader.table().columns()[0].name, "n");
        assert_eq!(reader.table().columns()[0].data_type(), TypeCode::Int64);
        assert_eq!(reader.read().await.unwrap(), Some(vec![Value::Int(3)]));
    }

    #[tokio::test]
    async fn test_memory_reader_lookup() {
        let table = docs();
        let rows = vec![
            vec![Value::Int(1), Value::Null, Value::Null],
            vec![Value::Int(2), Value::Null, Value::Null],
        ];
        let mut reader = MemoryReader::new(table.clone(), rows);
        let filter = Filter::value(table.column("id").unwrap().clone(), Compare::Equal, 2);
        let found = reader.lookup_row_direct(&[filter]).await.unwrap();
        assert_eq!(found.unwrap()[0], Value::Int(2));
        assert_eq!(read_all(&mut reader).await.unwrap().len(), 2);
    }
}
