//! INSERT / UPDATE / DELETE builders.

use super::filters::build_filters;
use super::params::ParamContext;
use super::select::Scope;
use crate::ast::{Column, DeleteQuery, DeltaType, Filter, InsertQuery, Table, UpdateQuery};
use crate::error::{EtlError, EtlResult};
use crate::types::Row;

/// Columns written by an insert: everything except database-assigned
/// identities and nested row columns, paired with their table ordinal.
pub fn insert_columns(table: &Table) -> Vec<(usize, &Column)> {
    table
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.delta_type != DeltaType::DbAutoIncrement && !c.is_parent())
        .collect()
}

/// Rows per multi-row insert so one command stays within the dialect's
/// parameter limit.
pub fn bulk_chunk_size(table: &Table, max_parameters: usize) -> usize {
    let width = insert_columns(table).len().max(1);
    (max_parameters / width).clamp(1, 1000)
}

pub fn build_insert(table: &Table, query: &InsertQuery, ctx: &mut ParamContext<'_>) -> EtlResult<String> {
    let dialect = ctx.dialect();
    let mut names = Vec::new();
    let mut values = Vec::new();
    for (i, qc) in query.columns.iter().enumerate() {
        if qc.column.delta_type == DeltaType::DbAutoIncrement || qc.column.is_parent() {
            continue;
        }
        names.push(dialect.quote(&qc.column.name));
        values.push(ctx.add_param(
            format!("col{}", i),
            qc.column.data_type(),
            qc.column.rank,
            qc.value.clone(),
        ));
    }
    if names.is_empty() {
        return Err(EtlError::compile(format!(
            "insert into '{}' has no columns",
            table.name
        )));
    }
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.table_name(table),
        names.join(", "),
        values.join(", ")
    ))
}

/// One multi-row insert for rows laid out by table ordinal.
pub fn build_bulk_insert(table: &Table, rows: &[Row], ctx: &mut ParamContext<'_>) -> EtlResult<String> {
    let dialect = ctx.dialect();
    let columns = insert_columns(table);
    if columns.is_empty() || rows.is_empty() {
        return Err(EtlError::compile(format!(
            "bulk insert into '{}' has no columns or rows",
            table.name
        )));
    }
    let names: Vec<String> = columns.iter().map(|(_, c)| dialect.quote(&c.name)).collect();
    let mut tuples = Vec::with_capacity(rows.len());
    for (r, row) in rows.iter().enumerate() {
        let placeholders: Vec<String> = columns
            .iter()
            .map(|(ordinal, column)| {
                let value = row.get(*ordinal).cloned().unwrap_or_default();
                ctx.add_param(format!("row{}col{}", r, ordinal), column.data_type(), column.rank, value)
            })
            .collect();
        tuples.push(format!("({})", placeholders.join(", ")));
    }
    Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        dialect.table_name(table),
        names.join(", "),
        tuples.join(", ")
    ))
}

/// DML filters must all be expressible; a skipped filter would widen the
/// set of affected rows.
fn dml_filters(filters: &[Filter], table: &Table, ctx: &mut ParamContext<'_>) -> EtlResult<String> {
    let scope = Scope::unqualified(ctx.dialect());
    let render = |c: &Column| -> EtlResult<String> { Ok(scope.column_ref(c)) };
    let mut skipped = Vec::new();
    let sql = build_filters(filters, "WHERE", "where", &render, ctx, &mut skipped)?;
    if !skipped.is_empty() {
        return Err(EtlError::compile(format!(
            "filters on '{}' cannot be expressed by the {} dialect",
            table.name,
            ctx.dialect().name
        )));
    }
    Ok(sql)
}

pub fn build_update(table: &Table, query: &UpdateQuery, ctx: &mut ParamContext<'_>) -> EtlResult<String> {
    let dialect = ctx.dialect();
    if query.columns.is_empty() {
        return Err(EtlError::compile(format!(
            "update of '{}' has no columns",
            table.name
        )));
    }
    let sets: Vec<String> = query
        .columns
        .iter()
        .enumerate()
        .map(|(i, qc)| {
            let param = ctx.add_param(
                format!("col{}", i),
                qc.column.data_type(),
                qc.column.rank,
                qc.value.clone(),
            );
            format!("{} = {}", dialect.quote(&qc.column.name), param)
        })
        .collect();
    let mut sql = format!("UPDATE {} SET {}", dialect.table_name(table), sets.join(", "));
    let where_sql = dml_filters(&query.filters, table, ctx)?;
    if !where_sql.is_empty() {
        sql.push(' ');
        sql.push_str(&where_sql);
    }
    Ok(sql)
}

pub fn build_delete(table: &Table, query: &DeleteQuery, ctx: &mut ParamContext<'_>) -> EtlResult<String> {
    let mut sql = format!("DELETE FROM {}", ctx.dialect().table_name(table));
    let where_sql = dml_filters(&query.filters, table, ctx)?;
    if !where_sql.is_empty() {
        sql.push(' ');
        sql.push_str(&where_sql);
    }
    Ok(sql)
}
