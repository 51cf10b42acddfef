//! SQL compiler for the query models.
//!
//! Converts tables and queries into dialect-specific SQL text. Every literal
//! is bound as a parameter; only identifiers are written into the text.

pub mod ddl;
pub mod dialect;
pub mod dml;
pub mod filters;
pub mod params;
pub mod select;

#[cfg(test)]
mod tests;

pub use dialect::{Dialect, LimitStyle, ParamStyle};
pub use filters::is_filter_supported;
pub use params::{ParamContext, Parameter};

use crate::ast::{Filter, SelectQuery, Table};
use crate::error::EtlResult;
use tracing::trace;

/// A compiled statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Parameter>,
    /// Output field names, in select-list order.
    pub fields: Vec<String>,
    /// Filters the dialect cannot evaluate; readers apply them to fetched rows.
    pub skipped_filters: Vec<Filter>,
}

/// Compile a select over `table`. `None` selects every non-ignored column.
pub fn compile(table: &Table, query: Option<&SelectQuery>, dialect: &Dialect) -> EtlResult<CompiledQuery> {
    let mut ctx = ParamContext::new(dialect);
    let mut skipped_filters = Vec::new();
    let (sql, fields) = select::build_select(table, query, &mut ctx, &mut skipped_filters)?;
    trace!(table = %table.name, sql = %sql, params = ctx.len(), "compiled select");
    Ok(CompiledQuery {
        sql,
        params: ctx.into_params(),
        fields,
        skipped_filters,
    })
}

/// Compile a `COUNT(*)` over `table` with the query's filters.
pub fn compile_count(table: &Table, query: Option<&SelectQuery>, dialect: &Dialect) -> EtlResult<CompiledQuery> {
    let mut ctx = ParamContext::new(dialect);
    let sql = select::build_count(table, query, &mut ctx)?;
    Ok(CompiledQuery {
        sql,
        params: ctx.into_params(),
        fields: vec!["count".to_string()],
        skipped_filters: Vec::new(),
    })
}
