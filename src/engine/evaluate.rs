//! In-process filter evaluation, used for filters a dialect cannot express
//! and by the in-memory store.

use crate::ast::{AndOr, Column, Compare, Filter, Sort, SortDirection, Table};
use crate::error::{EtlError, EtlResult};
use crate::types::{Row, Value};
use std::cmp::Ordering;

/// Evaluate a filter chain against `row`. AND binds tighter than OR; an
/// empty chain matches everything.
pub fn matches(table: &Table, row: &Row, filters: &[Filter]) -> EtlResult<bool> {
    let mut any_group = false;
    let mut group = true;
    for (i, filter) in filters.iter().enumerate() {
        group = group && matches_one(table, row, filter)?;
        let ends_group = i + 1 == filters.len() || filter.and_or == AndOr::Or;
        if ends_group {
            any_group = any_group || group;
            group = true;
        }
    }
    Ok(filters.is_empty() || any_group)
}

fn lookup(table: &Table, row: &Row, column: &Column) -> EtlResult<Value> {
    let ordinal = table.ordinal(&column.name).ok_or_else(|| {
        EtlError::compile(format!(
            "filter column '{}' is not in table '{}'",
            column.name, table.name
        ))
    })?;
    Ok(row.get(ordinal).cloned().unwrap_or_default())
}

fn side(
    table: &Table,
    row: &Row,
    column: Option<&Column>,
    value: Option<&Value>,
) -> EtlResult<Option<Value>> {
    if let Some(value) = value {
        return Ok(Some(value.clone()));
    }
    match column {
        Some(column) => lookup(table, row, column).map(Some),
        None => Ok(None),
    }
}

fn matches_one(table: &Table, row: &Row, filter: &Filter) -> EtlResult<bool> {
    let left = side(table, row, filter.left_column.as_ref(), filter.left_value.as_ref())?;
    let mut right = side(table, row, filter.right_column.as_ref(), filter.right_value.as_ref())?;

    if right.is_none()
        && let Some(column) = filter.left_column.as_ref().filter(|c| c.is_input)
    {
        right = column.typed_default()?;
    }

    let result = match (left, filter.compare) {
        (None, Compare::IsNull) => right.as_ref().is_none_or(Value::is_null),
        (None, _) => {
            return Err(EtlError::compile("filter has no left column or value"));
        }
        (Some(left), compare) => compare_values(&left, compare, right.as_ref()),
    };
    if result || !filter.allow_null {
        return Ok(result);
    }
    for column in [&filter.left_column, &filter.right_column].into_iter().flatten() {
        if lookup(table, row, column)?.is_null() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn compare_values(left: &Value, compare: Compare, right: Option<&Value>) -> bool {
    let right = right.unwrap_or(&Value::Null);
    match compare {
        Compare::IsNull => left.is_null(),
        Compare::IsNotNull => !left.is_null(),
        Compare::Equal if right.is_null() => left.is_null(),
        Compare::NotEqual if right.is_null() => !left.is_null(),
        Compare::In => in_list(left, right),
        Compare::NotIn => !left.is_null() && !in_list(left, right),
        Compare::Equal => equals(left, right),
        Compare::NotEqual => !left.is_null() && !equals(left, right),
        Compare::Like => match (left.as_str(), right.as_str()) {
            (Some(text), Some(pattern)) => like(text, pattern),
            _ => false,
        },
        Compare::GreaterThan => left.compare(right) == Some(Ordering::Greater),
        Compare::GreaterThanEqual => matches!(left.compare(right), Some(Ordering::Greater | Ordering::Equal)),
        Compare::LessThan => left.compare(right) == Some(Ordering::Less),
        Compare::LessThanEqual => matches!(left.compare(right), Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Scalar equality, or membership when either side is an array.
fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(items), other) | (other, Value::Array(items)) => {
            items.iter().any(|item| equals(item, other))
        }
        (a, b) => a.compare(b) == Some(Ordering::Equal),
    }
}

fn in_list(left: &Value, right: &Value) -> bool {
    match right {
        Value::Array(items) => items.iter().any(|item| equals(left, item)),
        scalar => equals(left, scalar),
    }
}

/// SQL `LIKE` with `%` and `_` wildcards.
pub fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    // reachable[j]: pattern[..i] matches text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for p in pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen = seen || reachable[j];
                    next[j] = seen;
                }
            }
            _ => {
                for j in 0..text.len() {
                    if reachable[j] && (p == '_' || p == text[j]) {
                        next[j + 1] = true;
                    }
                }
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}

/// Sort rows in place by the given sorts; nulls sort first.
pub fn sort_rows(table: &Table, rows: &mut [Row], sorts: &[Sort]) -> EtlResult<()> {
    let mut keys = Vec::with_capacity(sorts.len());
    for sort in sorts {
        let ordinal = table.ordinal(&sort.column.name).ok_or_else(|| {
            EtlError::compile(format!("sort column '{}' is not in table '{}'", sort.column.name, table.name))
        })?;
        keys.push((ordinal, sort.direction));
    }
    rows.sort_by(|a, b| {
        for (ordinal, direction) in &keys {
            let ordering = a[*ordinal].sort_cmp(&b[*ordinal]);
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCode;

    fn table() -> Table {
        Table::with_columns(
            "t",
            vec![
                Column::new("a", TypeCode::Int64),
                Column::new("b", TypeCode::String),
                Column::new("tags", TypeCode::String).array(1),
            ],
        )
        .unwrap()
    }

    fn col(name: &str) -> Column {
        table().column(name).unwrap().clone()
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let t = table();
        let row = vec![Value::Int(1), "x".into(), Value::Null];
        // a = 2 AND b = 'y' OR a = 1
        let filters = vec![
            Filter::value(col("a"), Compare::Equal, 2),
            Filter::value(col("b"), Compare::Equal, "y").or(),
            Filter::value(col("a"), Compare::Equal, 1),
        ];
        assert!(matches(&t, &row, &filters).unwrap());
        // a = 1 OR b = 'x' AND a = 2
        let filters = vec![
            Filter::value(col("a"), Compare::Equal, 3).or(),
            Filter::value(col("b"), Compare::Equal, "x"),
            Filter::value(col("a"), Compare::Equal, 2),
        ];
        assert!(!matches(&t, &row, &filters).unwrap());
        assert!(matches(&t, &row, &[]).unwrap());
    }

    #[test]
    fn test_null_semantics() {
        let t = table();
        let row = vec![Value::Null, "x".into(), Value::Null];
        assert!(!matches(&t, &row, &[Filter::value(col("a"), Compare::GreaterThan, 1)]).unwrap());
        assert!(matches(&t, &row, &[Filter::value(col("a"), Compare::GreaterThan, 1).allow_null()]).unwrap());
        assert!(matches(&t, &row, &[Filter::value(col("a"), Compare::Equal, Value::Null)]).unwrap());
        assert!(matches(&t, &row, &[Filter::null(col("a"), true)]).unwrap());
    }

    #[test]
    fn test_in_list_and_arrays() {
        let t = table();
        let row = vec![
            Value::Int(2),
            "x".into(),
            Value::Array(vec!["rust".into(), "sql".into()]),
        ];
        let list = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        assert!(matches(&t, &row, &[Filter::value(col("a"), Compare::In, list.clone())]).unwrap());
        assert!(!matches(&t, &row, &[Filter::value(col("a"), Compare::NotIn, list)]).unwrap());
        assert!(!matches(&t, &row, &[Filter::value(col("a"), Compare::In, Value::Array(vec![]))]).unwrap());
        assert!(matches(&t, &row, &[Filter::value(col("tags"), Compare::Equal, "sql")]).unwrap());
    }

    #[test]
    fn test_like() {
        assert!(like("hello", "h%o"));
        assert!(like("hello", "_ello"));
        assert!(like("hello", "%"));
        assert!(!like("hello", "h_o"));
        assert!(like("", "%"));
        assert!(!like("abc", "ab"));
    }

    #[test]
    fn test_sort_rows_nulls_first() {
        let t = table();
        let mut rows = vec![
            vec![Value::Int(2), "b".into(), Value::Null],
            vec![Value::Null, "c".into(), Value::Null],
            vec![Value::Int(1), "a".into(), Value::Null],
        ];
        sort_rows(&t, &mut rows, &[Sort::asc(col("a"))]).unwrap();
        assert_eq!(rows[0][0], Value::Null);
        assert_eq!(rows[2][0], Value::Int(2));
        sort_rows(&t, &mut rows, &[Sort::desc(col("b"))]).unwrap();
        assert_eq!(rows[0][1], Value::from("c"));
    }
}
