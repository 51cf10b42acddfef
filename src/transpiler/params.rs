use super::dialect::Dialect;
use crate::types::{TypeCode, Value};

/// A value bound to a compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Stable name, e.g. `where1Value2`. Rendered per the dialect's style.
    pub name: String,
    pub type_code: TypeCode,
    pub rank: u32,
    pub value: Value,
}

/// Collects parameters while a statement is being built.
#[derive(Debug)]
pub struct ParamContext<'d> {
    dialect: &'d Dialect,
    /// Collected parameters in placeholder order.
    pub params: Vec<Parameter>,
}

impl<'d> ParamContext<'d> {
    pub fn new(dialect: &'d Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    pub fn dialect(&self) -> &'d Dialect {
        self.dialect
    }

    /// Add a value and return the placeholder for it.
    pub fn add_param(
        &mut self,
        name: impl Into<String>,
        type_code: TypeCode,
        rank: u32,
        value: Value,
    ) -> String {
        let name = name.into();
        let placeholder = self.dialect.placeholder(&name, self.params.len() + 1, type_code);
        self.params.push(Parameter {
            name,
            type_code,
            rank,
            value,
        });
        placeholder
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_params(self) -> Vec<Parameter> {
        self.params
    }
}
