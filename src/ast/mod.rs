//! Table, column, filter and query models.

pub mod column;
pub mod filter;
pub mod query;
pub mod table;

pub use column::{Column, DeltaType, SecurityFlag};
pub use filter::{AndOr, Compare, Filter, Sort, SortDirection};
pub use query::{
    Aggregate, DeleteQuery, InsertQuery, Join, JoinType, QueryColumn, SelectColumn, SelectQuery,
    UpdateQuery,
};
pub use table::Table;

use crate::error::EtlError;
use crate::types::Value;
use std::fmt;

/// How a row is applied to the target, carried in the `DatabaseOperation` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Reject,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::Reject,
    ];

    pub fn code(&self) -> char {
        match self {
            Operation::Create => 'C',
            Operation::Update => 'U',
            Operation::Delete => 'D',
            Operation::Reject => 'R',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'C' => Some(Operation::Create),
            'U' => Some(Operation::Update),
            'D' => Some(Operation::Delete),
            'R' => Some(Operation::Reject),
            _ => None,
        }
    }

    /// Classify an operation-column value. Null means create.
    pub fn from_value(column: &str, value: &Value) -> Result<Self, EtlError> {
        let parsed = match value {
            Value::Null => return Ok(Operation::Create),
            Value::String(s) => {
                let mut chars = s.trim().chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Self::from_code(c),
                    _ => None,
                }
            }
            _ => None,
        };
        parsed.ok_or_else(|| {
            EtlError::conversion(
                column,
                crate::types::TypeCode::Char,
                format!("unknown database operation {}", value),
            )
        })
    }

    pub fn value(&self) -> Value {
        Value::String(self.code().to_string())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Reject => "reject",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_from_value() {
        assert_eq!(Operation::from_value("op", &Value::Null).unwrap(), Operation::Create);
        assert_eq!(Operation::from_value("op", &"u".into()).unwrap(), Operation::Update);
        assert_eq!(Operation::from_value("op", &"R".into()).unwrap(), Operation::Reject);
        assert!(Operation::from_value("op", &"X".into()).is_err());
        assert!(Operation::from_value("op", &"CU".into()).is_err());
    }
}
