//! Table-level DDL and catalog statements.

use super::dialect::Dialect;
use super::params::ParamContext;
use crate::ast::{Column, DeltaType, Table};
use crate::types::{TypeCode, Value};

pub fn build_create_table(table: &Table, dialect: &Dialect) -> String {
    let columns: Vec<String> = table
        .columns()
        .iter()
        .filter(|c| !c.is_parent())
        .map(|c| column_definition(c, dialect))
        .collect();
    format!(
        "CREATE TABLE {} ({})",
        dialect.table_name(table),
        columns.join(", ")
    )
}

fn column_definition(column: &Column, dialect: &Dialect) -> String {
    let name = dialect.quote(&column.name);
    if column.delta_type == DeltaType::DbAutoIncrement {
        return format!("{} {}", name, dialect.identity);
    }
    let mut def = format!("{} {}", name, (dialect.type_name)(column));
    if !column.allow_db_null {
        def.push_str(" NOT NULL");
    }
    if column.is_unique {
        def.push_str(" UNIQUE");
    }
    def
}

pub fn build_drop_table(table: &Table, dialect: &Dialect) -> String {
    format!("DROP TABLE IF EXISTS {}", dialect.table_name(table))
}

/// `TRUNCATE TABLE` where the dialect allows it, otherwise a full delete.
pub fn build_truncate(table: &Table, dialect: &Dialect) -> String {
    if dialect.allows_truncate {
        format!("TRUNCATE TABLE {}", dialect.table_name(table))
    } else {
        format!("DELETE FROM {}", dialect.table_name(table))
    }
}

pub fn build_max(table: &Table, column: &Column, dialect: &Dialect) -> String {
    format!(
        "SELECT MAX({}) FROM {}",
        dialect.quote(&column.name),
        dialect.table_name(table)
    )
}

/// Catalog lookup; binds the table name as its only parameter.
pub fn build_table_exists(table: &Table, ctx: &mut ParamContext<'_>) -> String {
    ctx.add_param("name", TypeCode::String, 0, Value::String(table.name.clone()));
    ctx.dialect().table_exists.to_string()
}
