//! Tables: an ordered, name-unique column set.

use super::column::{Column, DeltaType};
use crate::error::{EtlError, EtlResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Table {
    pub name: String,
    pub schema: Option<String>,
    columns: Vec<Column>,
    /// When set the table is a view over this query text.
    pub query_string: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build a table, rejecting duplicate column names.
    pub fn with_columns(name: impl Into<String>, columns: Vec<Column>) -> EtlResult<Self> {
        let mut table = Self::new(name);
        for column in columns {
            table.add_column(column)?;
        }
        Ok(table)
    }

    pub fn add_column(&mut self, column: Column) -> EtlResult<()> {
        if self.ordinal(&column.name).is_some() {
            return Err(EtlError::Config(format!(
                "table '{}' already has a column named '{}'",
                self.name, column.name
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_by_delta(&self, delta_type: DeltaType) -> Option<&Column> {
        self.columns.iter().find(|c| c.delta_type == delta_type)
    }

    pub fn ordinal_by_delta(&self, delta_type: DeltaType) -> Option<usize> {
        self.columns.iter().position(|c| c.delta_type == delta_type)
    }

    /// The auto-increment column, in-process or database assigned.
    pub fn auto_increment(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_auto_increment())
    }

    /// Columns used to match rows for update and delete.
    ///
    /// Surrogate keys first, then the auto-increment column, then natural keys.
    pub fn key_columns(&self) -> Vec<&Column> {
        let surrogate: Vec<&Column> = self
            .columns
            .iter()
            .filter(|c| c.delta_type == DeltaType::SurrogateKey)
            .collect();
        if !surrogate.is_empty() {
            return surrogate;
        }
        if let Some(auto) = self.auto_increment() {
            return vec![auto];
        }
        self.columns
            .iter()
            .filter(|c| c.delta_type == DeltaType::NaturalKey)
            .collect()
    }

    /// Fully qualified name for display (`schema.name`).
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// Same columns under another name, e.g. a reject table.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query_string: None,
            ..self.clone()
        }
    }

    /// Copy the column definitions for a derived table.
    pub fn copy_columns(&self) -> Vec<Column> {
        self.columns.iter().map(|c| c.copy(true)).collect()
    }
}
