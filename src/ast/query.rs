//! Query models consumed by the compiler.

use super::column::Column;
use super::filter::{Filter, Sort};
use super::table::Table;
use crate::error::EtlError;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    #[default]
    None,
    Sum,
    Average,
    Min,
    Max,
    Count,
}

impl Aggregate {
    /// SQL function name; `None` for a plain column.
    pub fn function(&self) -> Option<&'static str> {
        match self {
            Aggregate::None => None,
            Aggregate::Sum => Some("SUM"),
            Aggregate::Average => Some("AVG"),
            Aggregate::Min => Some("MIN"),
            Aggregate::Max => Some("MAX"),
            Aggregate::Count => Some("COUNT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub column: Column,
    pub aggregate: Aggregate,
    /// Explicit output name; derived from the column when absent.
    pub output_name: Option<String>,
}

impl SelectColumn {
    pub fn new(column: Column) -> Self {
        Self {
            column,
            aggregate: Aggregate::None,
            output_name: None,
        }
    }

    pub fn aggregate(column: Column, aggregate: Aggregate) -> Self {
        Self {
            column,
            aggregate,
            output_name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// Keyword placed before `JOIN`; empty for inner joins.
    pub fn keyword(&self) -> &'static str {
        match self {
            JoinType::Inner => "",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL OUTER",
        }
    }
}

impl FromStr for JoinType {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" | "" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full" | "outer" => Ok(JoinType::Full),
            other => Err(EtlError::compile(format!("the join type '{}' is not supported", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: Table,
    pub alias: String,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub alias: Option<String>,
    pub columns: Vec<SelectColumn>,
    pub joins: Vec<Join>,
    pub filters: Vec<Filter>,
    pub groups: Vec<Column>,
    /// HAVING filters; columns are matched to projected output names.
    pub group_filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    /// Row limit, 0 or `None` for unlimited.
    pub rows: Option<u64>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn column(mut self, column: SelectColumn) -> Self {
        self.columns.push(column);
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group(mut self, column: Column) -> Self {
        self.groups.push(column);
        self
    }

    pub fn having(mut self, filter: Filter) -> Self {
        self.group_filters.push(filter);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn limit(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }
}

/// A column paired with the value to write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryColumn {
    pub column: Column,
    pub value: Value,
}

impl QueryColumn {
    pub fn new(column: Column, value: impl Into<Value>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertQuery {
    pub columns: Vec<QueryColumn>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateQuery {
    pub columns: Vec<QueryColumn>,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteQuery {
    pub filters: Vec<Filter>,
}
