//! Filter chain to SQL predicate translation.

use super::dialect::Dialect;
use super::params::ParamContext;
use crate::ast::{AndOr, Column, Compare, Filter};
use crate::error::{EtlError, EtlResult};
use crate::types::{TypeCode, Value};
use tracing::warn;

/// Renders a column reference in the current statement scope.
pub type ColumnRenderer<'a> = dyn Fn(&Column) -> EtlResult<String> + 'a;

/// Whether the dialect can evaluate this filter in SQL.
pub fn is_filter_supported(filter: &Filter, dialect: &Dialect) -> bool {
    dialect.supports_array_filters || !filter.is_array_filter()
}

/// Type used to bind literals: the referenced column's type, else the value's own.
fn best_type(filter: &Filter) -> TypeCode {
    if filter.compare == Compare::Like {
        return TypeCode::String;
    }
    filter
        .left_column
        .as_ref()
        .or(filter.right_column.as_ref())
        .map(Column::data_type)
        .or_else(|| {
            filter
                .right_value
                .as_ref()
                .or(filter.left_value.as_ref())
                .map(Value::type_code)
        })
        .unwrap_or(TypeCode::Unknown)
}

fn bind_literal(
    ctx: &mut ParamContext<'_>,
    name: String,
    type_code: TypeCode,
    value: &Value,
) -> EtlResult<String> {
    let converted = value
        .convert(type_code)
        .map_err(|message| EtlError::conversion(&name, type_code, message))?;
    Ok(ctx.add_param(name, type_code, 0, converted))
}

fn bind_default(ctx: &mut ParamContext<'_>, name: String, column: &Column) -> EtlResult<String> {
    let value = column.typed_default()?.unwrap_or(Value::Null);
    Ok(ctx.add_param(name, column.data_type(), column.rank, value))
}

/// Translate a filter chain into `<clause> (g1) AND (g2) OR (g3)`.
///
/// `prefix` namespaces parameter names (`where1Value2`, `join2Value1`, ...).
/// Filters the dialect cannot evaluate are pushed onto `skipped` and do not
/// consume an index. Returns an empty string when nothing is emitted.
pub fn build_filters(
    filters: &[Filter],
    clause: &str,
    prefix: &str,
    render: &ColumnRenderer<'_>,
    ctx: &mut ParamContext<'_>,
    skipped: &mut Vec<Filter>,
) -> EtlResult<String> {
    let dialect = ctx.dialect();
    let mut sql = String::new();
    let mut previous: Option<&Filter> = None;
    let mut index = 0;

    // A chain containing OR is evaluated whole, in SQL or after read.
    let splits_or = filters
        .split_last()
        .is_some_and(|(_, init)| init.iter().any(|f| f.and_or == AndOr::Or));
    if splits_or && filters.iter().any(|f| !is_filter_supported(f, dialect)) {
        warn!(
            dialect = dialect.name,
            count = filters.len(),
            "OR chain has a filter the dialect cannot express; applying the whole chain after read"
        );
        skipped.extend(filters.iter().cloned());
        return Ok(sql);
    }

    for filter in filters {
        if !is_filter_supported(filter, dialect) {
            warn!(
                column = filter.left_column.as_ref().map(|c| c.name.as_str()).unwrap_or_default(),
                dialect = dialect.name,
                "filter on array column cannot be expressed in SQL; applying after read"
            );
            skipped.push(filter.clone());
            continue;
        }
        index += 1;

        let group = build_group(filter, index, prefix, render, ctx)?;
        match previous {
            None => {
                if !clause.is_empty() {
                    sql.push_str(clause);
                    sql.push(' ');
                }
            }
            Some(prev) => {
                sql.push(' ');
                sql.push_str(prev.and_or.sql());
                sql.push(' ');
            }
        }
        sql.push('(');
        sql.push_str(&group);
        sql.push(')');
        previous = Some(filter);
    }

    Ok(sql)
}

fn build_group(
    filter: &Filter,
    index: usize,
    prefix: &str,
    render: &ColumnRenderer<'_>,
    ctx: &mut ParamContext<'_>,
) -> EtlResult<String> {
    let mut sql = if filter.left_column.is_none() && filter.compare == Compare::IsNull {
        match &filter.right_column {
            Some(right) => format!("{} IS NULL", render(right)?),
            None => {
                let left = filter.left_value.clone().unwrap_or(Value::Null);
                let param = bind_literal(ctx, format!("{}{}Value1", prefix, index), best_type(filter), &left)?;
                format!("{} IS NULL", param)
            }
        }
    } else {
        let left = match (&filter.left_column, &filter.left_value) {
            (Some(column), _) if column.is_input && filter.right_value.is_none() => {
                bind_default(ctx, format!("{}{}Column1Default", prefix, index), column)?
            }
            (Some(column), _) => render(column)?,
            (None, Some(value)) => {
                bind_literal(ctx, format!("{}{}Value1", prefix, index), best_type(filter), value)?
            }
            (None, None) => {
                return Err(EtlError::compile(
                    "the filter has no values or columns specified for the left side",
                ));
            }
        };

        if filter.compare == Compare::Equal && filter.right_is_absent() {
            format!("{} IS NULL", left)
        } else if matches!(filter.compare, Compare::IsNull | Compare::IsNotNull) {
            format!("{} {}", left, filter.compare.sql())
        } else {
            let right = build_right(filter, index, prefix, render, ctx)?;
            format!("{} {} {}", left, filter.compare.sql(), right)
        }
    };

    if filter.allow_null {
        for column in [&filter.left_column, &filter.right_column].into_iter().flatten() {
            sql.push_str(&format!(" OR {} IS NULL", render(column)?));
        }
    }

    Ok(sql)
}

fn build_right(
    filter: &Filter,
    index: usize,
    prefix: &str,
    render: &ColumnRenderer<'_>,
    ctx: &mut ParamContext<'_>,
) -> EtlResult<String> {
    if let Some(column) = &filter.right_column {
        return if column.is_input {
            bind_default(ctx, format!("{}{}Column2Default", prefix, index), column)
        } else {
            render(column)
        };
    }

    let type_code = best_type(filter);
    match &filter.right_value {
        Some(Value::Array(items)) if items.is_empty() => Ok("(null)".to_string()),
        Some(Value::Array(items)) => {
            let placeholders = items
                .iter()
                .enumerate()
                .map(|(k, item)| {
                    bind_literal(ctx, format!("{}{}ArrayValue{}", prefix, index, k), type_code, item)
                })
                .collect::<EtlResult<Vec<_>>>()?;
            Ok(format!("({})", placeholders.join(", ")))
        }
        value => {
            let value = value.clone().unwrap_or(Value::Null);
            let param = bind_literal(ctx, format!("{}{}Value2", prefix, index), type_code, &value)?;
            if matches!(filter.compare, Compare::In | Compare::NotIn) {
                Ok(format!("({})", param))
            } else {
                Ok(param)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plain(dialect: &Dialect) -> impl Fn(&Column) -> EtlResult<String> + '_ {
        move |c: &Column| Ok(dialect.quote(&c.name))
    }

    fn compile(filters: &[Filter], dialect: &Dialect) -> (String, Vec<String>, usize) {
        let render = plain(dialect);
        let mut ctx = ParamContext::new(dialect);
        let mut skipped = Vec::new();
        let sql = build_filters(filters, "WHERE", "where", &render, &mut ctx, &mut skipped).unwrap();
        let names = ctx.params.iter().map(|p| p.name.clone()).collect();
        (sql, names, skipped.len())
    }

    #[test]
    fn test_chain_keeps_order_and_drops_last_combinator() {
        let dialect = Dialect::sqlserver();
        let a = Column::new("a", TypeCode::Int64);
        let b = Column::new("b", TypeCode::String);
        let filters = vec![
            Filter::value(a.clone(), Compare::GreaterThan, 1).or(),
            Filter::value(b, Compare::Equal, "x"),
            Filter::value(a, Compare::LessThan, 10).or(),
        ];
        let (sql, names, _) = compile(&filters, &dialect);
        assert_eq!(
            sql,
            "WHERE ([a] > @where1Value2) OR ([b] = @where2Value2) AND ([a] < @where3Value2)"
        );
        assert_eq!(names, vec!["where1Value2", "where2Value2", "where3Value2"]);
    }

    #[test]
    fn test_equal_without_right_side_is_null() {
        let dialect = Dialect::postgres();
        let filters = vec![Filter {
            left_column: Some(Column::new("a", TypeCode::String)),
            compare: Compare::Equal,
            ..Default::default()
        }];
        let (sql, names, _) = compile(&filters, &dialect);
        assert_eq!(sql, "WHERE (\"a\" IS NULL)");
        assert!(names.is_empty());
    }

    #[test]
    fn test_in_lists() {
        let dialect = Dialect::sqlserver();
        let code = Column::new("code", TypeCode::String);
        let filters = vec![
            Filter::value(code.clone(), Compare::In, Value::Array(vec!["a".into(), "b".into()])),
            Filter::value(code.clone(), Compare::NotIn, Value::Array(vec![])),
            Filter::value(code, Compare::In, "c"),
        ];
        let (sql, names, _) = compile(&filters, &dialect);
        assert_eq!(
            sql,
            "WHERE ([code] IN (@where1ArrayValue0, @where1ArrayValue1)) AND ([code] NOT IN (null)) AND ([code] IN (@where3Value2))"
        );
        assert_eq!(names, vec!["where1ArrayValue0", "where1ArrayValue1", "where3Value2"]);
    }

    #[test]
    fn test_allow_null_and_null_left() {
        let dialect = Dialect::postgres();
        let a = Column::new("a", TypeCode::Int64);
        let b = Column::new("b", TypeCode::Int64);
        let filters = vec![
            Filter::columns(a, Compare::GreaterThanEqual, b.clone()).allow_null(),
            Filter {
                right_column: Some(b),
                compare: Compare::IsNull,
                ..Default::default()
            },
        ];
        let (sql, _, _) = compile(&filters, &dialect);
        assert_eq!(
            sql,
            "WHERE (\"a\" >= \"b\" OR \"a\" IS NULL OR \"b\" IS NULL) AND (\"b\" IS NULL)"
        );
    }

    #[test]
    fn test_input_columns_bind_defaults() {
        let dialect = Dialect::sqlserver();
        let region = Column::new("region", TypeCode::Int32).input("4");
        let other = Column::new("other", TypeCode::Int32).input("9");
        let filters = vec![Filter::columns(region, Compare::Equal, other)];
        let render = plain(&dialect);
        let mut ctx = ParamContext::new(&dialect);
        let sql = build_filters(&filters, "", "join1", &render, &mut ctx, &mut Vec::new()).unwrap();
        assert_eq!(sql, "(@join1Column1Default = @join1Column2Default)");
        assert_eq!(ctx.params[0].value, Value::Int(4));
        assert_eq!(ctx.params[1].value, Value::Int(9));
    }

    #[test]
    fn test_left_value_literal() {
        let dialect = Dialect::postgres();
        let filters = vec![Filter {
            left_value: Some(Value::Int(5)),
            compare: Compare::LessThan,
            right_column: Some(Column::new("qty", TypeCode::Int64)),
            ..Default::default()
        }];
        let (sql, names, _) = compile(&filters, &dialect);
        assert_eq!(sql, "WHERE ($1 < \"qty\")");
        assert_eq!(names, vec!["where1Value1"]);
    }

    #[test]
    fn test_missing_left_side_is_compile_error() {
        let dialect = Dialect::postgres();
        let render = plain(&dialect);
        let mut ctx = ParamContext::new(&dialect);
        let filters = vec![Filter {
            compare: Compare::Equal,
            right_value: Some(Value::Int(1)),
            ..Default::default()
        }];
        let err = build_filters(&filters, "WHERE", "where", &render, &mut ctx, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, EtlError::Compile(_)));
    }

    #[test]
    fn test_array_filters_skipped_without_consuming_index() {
        let dialect = Dialect::sqlserver();
        let tags = Column::new("tags", TypeCode::String).array(1);
        let a = Column::new("a", TypeCode::Int64);
        let filters = vec![
            Filter::value(tags, Compare::Equal, "x"),
            Filter::value(a, Compare::Equal, 1),
        ];
        let (sql, names, skipped) = compile(&filters, &dialect);
        assert_eq!(sql, "WHERE ([a] = @where1Value2)");
        assert_eq!(names, vec!["where1Value2"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_literal_converted_to_column_type() {
        let dialect = Dialect::postgres();
        let render = plain(&dialect);
        let mut ctx = ParamContext::new(&dialect);
        let filters = vec![Filter::value(Column::new("a", TypeCode::Int32), Compare::Equal, "12")];
        build_filters(&filters, "WHERE", "where", &render, &mut ctx, &mut Vec::new()).unwrap();
        assert_eq!(ctx.params[0].value, Value::Int(12));

        let bad = vec![Filter::value(Column::new("a", TypeCode::Int32), Compare::Equal, "x")];
        let mut ctx = ParamContext::new(&dialect);
        let err = build_filters(&bad, "WHERE", "where", &render, &mut ctx, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, EtlError::Conversion { .. }));
    }
}
