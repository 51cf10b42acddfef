//! SELECT statement builder.

use super::dialect::{Dialect, LimitStyle};
use super::filters::build_filters;
use super::params::ParamContext;
use crate::ast::{
    Aggregate, Column, DeltaType, Filter, SelectQuery, SortDirection, Table,
};
use crate::error::{EtlError, EtlResult};
use crate::types::TypeCode;

/// Name resolution for one statement: columns are qualified only when the
/// query declares an alias or joins other tables.
pub(crate) struct Scope<'a> {
    dialect: &'a Dialect,
    alias: Option<String>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(table: &Table, query: Option<&SelectQuery>, dialect: &'a Dialect) -> Self {
        let alias = query
            .filter(|q| q.alias.is_some() || !q.joins.is_empty())
            .map(|q| q.alias.clone().unwrap_or_else(|| table.name.clone()));
        Self { dialect, alias }
    }

    pub(crate) fn unqualified(dialect: &'a Dialect) -> Self {
        Self {
            dialect,
            alias: None,
        }
    }

    fn qualifier<'c>(&'c self, column: &'c Column) -> Option<&'c str> {
        column.reference_table.as_deref().or(self.alias.as_deref())
    }

    pub(crate) fn column_ref(&self, column: &Column) -> String {
        match self.qualifier(column) {
            Some(q) => format!("{}.{}", self.dialect.quote(q), self.dialect.quote(&column.name)),
            None => self.dialect.quote(&column.name),
        }
    }

    /// Output field name: explicit name as-is, else `alias__column` when qualified.
    fn field_name(&self, column: &Column, output: Option<&str>) -> String {
        match (output, self.qualifier(column)) {
            (Some(name), _) => name.to_string(),
            (None, Some(q)) => format!("{}__{}", q, column.name),
            (None, None) => column.name.clone(),
        }
    }

    fn from_source(&self, table: &Table, alias: Option<&str>) -> String {
        match (&table.query_string, alias) {
            (Some(query), alias) => {
                format!("({}) {}", query, self.dialect.quote(alias.unwrap_or(&table.name)))
            }
            (None, Some(alias)) => format!("{} {}", self.dialect.table_name(table), self.dialect.quote(alias)),
            (None, None) => self.dialect.table_name(table),
        }
    }
}

struct Projection {
    expr: String,
    field: String,
    source: String,
    type_code: TypeCode,
    rank: u32,
}

fn projections(table: &Table, query: Option<&SelectQuery>, scope: &Scope<'_>) -> Vec<Projection> {
    match query.filter(|q| !q.columns.is_empty()) {
        Some(q) => q
            .columns
            .iter()
            .map(|sc| {
                let column_ref = scope.column_ref(&sc.column);
                let expr = match sc.aggregate.function() {
                    Some(f) => format!("{}({})", f, column_ref),
                    None => column_ref,
                };
                let type_code = match sc.aggregate {
                    Aggregate::Count => TypeCode::Int64,
                    Aggregate::Average => TypeCode::Double,
                    _ => sc.column.data_type(),
                };
                Projection {
                    expr,
                    field: scope.field_name(&sc.column, sc.output_name.as_deref()),
                    source: sc.column.name.clone(),
                    type_code,
                    rank: sc.column.rank,
                }
            })
            .collect(),
        None => table
            .columns()
            .iter()
            .filter(|c| c.delta_type != DeltaType::IgnoreField && !c.is_parent())
            .map(|c| Projection {
                expr: scope.column_ref(c),
                field: scope.field_name(c, None),
                source: c.name.clone(),
                type_code: c.data_type(),
                rank: c.rank,
            })
            .collect(),
    }
}

/// Equality filters that pass input-column defaults through to the query.
fn input_filters(table: &Table) -> Vec<Filter> {
    table
        .columns()
        .iter()
        .filter(|c| c.is_input)
        .filter_map(|c| {
            let default = c.default_value.as_deref()?;
            if default.trim().is_empty() {
                return None;
            }
            Some(Filter::value(c.clone(), crate::ast::Compare::Equal, default))
        })
        .collect()
}

/// Returns the statement text and the output field names.
pub(crate) fn build_select(
    table: &Table,
    query: Option<&SelectQuery>,
    ctx: &mut ParamContext<'_>,
    skipped: &mut Vec<Filter>,
) -> EtlResult<(String, Vec<String>)> {
    let dialect = ctx.dialect();
    let scope = Scope::new(table, query, dialect);
    let projections = projections(table, query, &scope);
    if projections.is_empty() {
        return Err(EtlError::compile(format!(
            "table '{}' has no columns to select",
            table.name
        )));
    }
    let rows = query.and_then(|q| q.rows).filter(|n| *n > 0);

    let mut sql = String::from("SELECT ");
    if let (LimitStyle::Top, Some(n)) = (dialect.limit_style, rows) {
        sql.push_str(&format!("TOP {} ", n));
    }
    let list: Vec<String> = projections
        .iter()
        .map(|p| {
            let quoted = dialect.quote(&p.field);
            if p.expr == quoted {
                p.expr.clone()
            } else {
                format!("{} AS {}", p.expr, quoted)
            }
        })
        .collect();
    sql.push_str(&list.join(", "));
    sql.push_str(" FROM ");
    sql.push_str(&scope.from_source(table, scope.alias.as_deref()));

    let render = |c: &Column| -> EtlResult<String> { Ok(scope.column_ref(c)) };

    if let Some(q) = query {
        for (i, join) in q.joins.iter().enumerate() {
            if join.filters.is_empty() {
                return Err(EtlError::compile(format!(
                    "join to '{}' has no join condition",
                    join.table.name
                )));
            }
            let keyword = join.join_type.keyword();
            sql.push(' ');
            if !keyword.is_empty() {
                sql.push_str(keyword);
                sql.push(' ');
            }
            sql.push_str("JOIN ");
            sql.push_str(&scope.from_source(&join.table, Some(&join.alias)));
            sql.push_str(" ON ");
            let on = build_filters(&join.filters, "", &format!("join{}", i + 1), &render, ctx, skipped)?;
            if on.is_empty() {
                return Err(EtlError::compile(format!(
                    "join to '{}' has no condition the dialect supports",
                    join.table.name
                )));
            }
            sql.push_str(&on);
        }
    }

    let mut filters: Vec<Filter> = query.map(|q| q.filters.clone()).unwrap_or_default();
    filters.extend(input_filters(table));
    let where_sql = build_filters(&filters, "WHERE", "where", &render, ctx, skipped)?;
    if !where_sql.is_empty() {
        sql.push(' ');
        sql.push_str(&where_sql);
    }

    if let Some(q) = query {
        if !q.groups.is_empty() {
            let groups: Vec<String> = q.groups.iter().map(|c| scope.column_ref(c)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }

        if !q.group_filters.is_empty() {
            let having = having_filters(&q.group_filters, &projections)?;
            let render_projection = |c: &Column| {
                projections
                    .iter()
                    .find(|p| p.field == c.name)
                    .map(|p| p.expr.clone())
                    .ok_or_else(|| EtlError::compile(format!("'{}' is not in the select list", c.name)))
            };
            let having_sql = build_filters(&having, "HAVING", "having", &render_projection, ctx, skipped)?;
            if !having_sql.is_empty() {
                sql.push(' ');
                sql.push_str(&having_sql);
            }
        }

        if !q.sorts.is_empty() {
            let sorts: Vec<String> = q
                .sorts
                .iter()
                .map(|s| match s.direction {
                    SortDirection::Ascending => scope.column_ref(&s.column),
                    SortDirection::Descending => format!("{} DESC", scope.column_ref(&s.column)),
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&sorts.join(", "));
        }
    }

    match (dialect.limit_style, rows) {
        (LimitStyle::Limit, Some(n)) => sql.push_str(&format!(" LIMIT {}", n)),
        (LimitStyle::FetchFirst, Some(n)) => sql.push_str(&format!(" FETCH FIRST {} ROWS ONLY", n)),
        _ => {}
    }

    Ok((sql, projections.into_iter().map(|p| p.field).collect()))
}

/// Rewrite HAVING filters so their columns name projected fields.
fn having_filters(filters: &[Filter], projections: &[Projection]) -> EtlResult<Vec<Filter>> {
    let resolve = |column: &Option<Column>| -> EtlResult<Option<Column>> {
        let Some(column) = column else {
            return Ok(None);
        };
        let projection = projections
            .iter()
            .find(|p| p.field == column.name)
            .or_else(|| projections.iter().find(|p| p.source == column.name))
            .ok_or_else(|| {
                EtlError::compile(format!(
                    "having column '{}' is not in the select list",
                    column.name
                ))
            })?;
        Ok(Some(Column::new(&projection.field, projection.type_code).array(projection.rank)))
    };

    filters
        .iter()
        .map(|f| {
            Ok(Filter {
                left_column: resolve(&f.left_column)?,
                right_column: resolve(&f.right_column)?,
                ..f.clone()
            })
        })
        .collect()
}

/// `SELECT COUNT(*) FROM table [WHERE ...]`
pub(crate) fn build_count(
    table: &Table,
    query: Option<&SelectQuery>,
    ctx: &mut ParamContext<'_>,
) -> EtlResult<String> {
    let dialect = ctx.dialect();
    let scope = Scope::new(table, query, dialect);
    let mut sql = format!(
        "SELECT COUNT(*) FROM {}",
        scope.from_source(table, scope.alias.as_deref())
    );
    let render = |c: &Column| -> EtlResult<String> { Ok(scope.column_ref(c)) };
    let mut filters: Vec<Filter> = query.map(|q| q.filters.clone()).unwrap_or_default();
    filters.extend(input_filters(table));
    let mut skipped = Vec::new();
    let where_sql = build_filters(&filters, "WHERE", "where", &render, ctx, &mut skipped)?;
    if !skipped.is_empty() {
        return Err(EtlError::compile(format!(
            "row count on '{}' uses filters the dialect cannot express",
            table.name
        )));
    }
    if !where_sql.is_empty() {
        sql.push(' ');
        sql.push_str(&where_sql);
    }
    Ok(sql)
}
