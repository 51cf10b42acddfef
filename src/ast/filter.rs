//! Filter predicates. A filter list is a chain: order and combinators are
//! kept exactly as supplied and the last combinator is dropped.

use super::column::Column;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compare {
    #[default]
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    IsNull,
    IsNotNull,
    Like,
    In,
    NotIn,
}

impl Compare {
    /// SQL operator text.
    pub fn sql(&self) -> &'static str {
        match self {
            Compare::Equal => "=",
            Compare::NotEqual => "!=",
            Compare::GreaterThan => ">",
            Compare::GreaterThanEqual => ">=",
            Compare::LessThan => "<",
            Compare::LessThanEqual => "<=",
            Compare::IsNull => "IS NULL",
            Compare::IsNotNull => "IS NOT NULL",
            Compare::Like => "LIKE",
            Compare::In => "IN",
            Compare::NotIn => "NOT IN",
        }
    }
}

impl fmt::Display for Compare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AndOr {
    #[default]
    And,
    Or,
}

impl AndOr {
    pub fn sql(&self) -> &'static str {
        match self {
            AndOr::And => "AND",
            AndOr::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub left_column: Option<Column>,
    pub left_value: Option<Value>,
    pub compare: Compare,
    pub right_column: Option<Column>,
    /// Scalar, or `Value::Array` for in-lists.
    pub right_value: Option<Value>,
    /// Also match rows where a referenced column is null.
    pub allow_null: bool,
    /// Links this filter to the next one.
    pub and_or: AndOr,
}

impl Filter {
    /// `column <compare> value`
    pub fn value(column: Column, compare: Compare, value: impl Into<Value>) -> Self {
        Self {
            left_column: Some(column),
            compare,
            right_value: Some(value.into()),
            ..Default::default()
        }
    }

    /// `left <compare> right`
    pub fn columns(left: Column, compare: Compare, right: Column) -> Self {
        Self {
            left_column: Some(left),
            compare,
            right_column: Some(right),
            ..Default::default()
        }
    }

    /// `column IS NULL` / `column IS NOT NULL`
    pub fn null(column: Column, is_null: bool) -> Self {
        Self {
            left_column: Some(column),
            compare: if is_null {
                Compare::IsNull
            } else {
                Compare::IsNotNull
            },
            ..Default::default()
        }
    }

    pub fn or(mut self) -> Self {
        self.and_or = AndOr::Or;
        self
    }

    pub fn allow_null(mut self) -> Self {
        self.allow_null = true;
        self
    }

    /// Right side is neither a column nor a non-null value.
    pub fn right_is_absent(&self) -> bool {
        self.right_column.is_none() && self.right_value.as_ref().is_none_or(Value::is_null)
    }

    /// Any side refers to an array-typed column or carries an array literal
    /// compared with something other than an in-list.
    pub fn is_array_filter(&self) -> bool {
        let array_column = [&self.left_column, &self.right_column]
            .into_iter()
            .flatten()
            .any(Column::is_array);
        let in_list = matches!(self.compare, Compare::In | Compare::NotIn);
        let array_literal = !in_list
            && [&self.left_value, &self.right_value]
                .into_iter()
                .flatten()
                .any(|v| matches!(v, Value::Array(_)));
        array_column || array_literal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub column: Column,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(column: Column) -> Self {
        Self {
            column,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(column: Column) -> Self {
        Self {
            column,
            direction: SortDirection::Descending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCode;

    #[test]
    fn test_right_is_absent() {
        let col = Column::new("a", TypeCode::String);
        assert!(Filter::null(col.clone(), true).right_is_absent());
        assert!(Filter::value(col.clone(), Compare::Equal, Value::Null).right_is_absent());
        assert!(!Filter::value(col, Compare::Equal, 1).right_is_absent());
    }

    #[test]
    fn test_array_filter_detection() {
        let tags = Column::new("tags", TypeCode::String).array(1);
        let code = Column::new("code", TypeCode::String);
        assert!(Filter::value(tags, Compare::Equal, "x").is_array_filter());
        let in_list = Filter::value(code.clone(), Compare::In, Value::Array(vec!["a".into()]));
        assert!(!in_list.is_array_filter());
        let eq_array = Filter::value(code, Compare::Equal, Value::Array(vec![]));
        assert!(eq_array.is_array_filter());
    }
}
