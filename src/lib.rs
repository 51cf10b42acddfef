//! # deltaflow
//!
//! Delta-aware ETL: compile table and query models to dialect-specific SQL,
//! read rows from a source, and write them to a target in ordered,
//! transactional batches.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use deltaflow::prelude::*;
//!
//! let people = Table::with_columns("people", vec![
//!     Column::new("id", TypeCode::Int64).delta(DeltaType::NaturalKey),
//!     Column::new("name", TypeCode::String),
//! ])?;
//! let filters = deltaflow::parse_filters("name like 'A%'", &people)?;
//! let query = SelectQuery { filters, ..Default::default() };
//! let compiled = deltaflow::compile(&people, Some(&query), &Dialect::postgres())?;
//! // => SELECT "id", "name" FROM "people" WHERE ("name" LIKE $1)
//! ```
//!
//! ## Write pipeline
//!
//! | Stage      | Type                          |
//! |------------|-------------------------------|
//! | Read       | [`reader::RowReader`]         |
//! | Validate   | [`validation::ValidatingReader`] |
//! | Classify   | [`writer::TransformWriter`]   |
//! | Flush      | [`engine::Connection`]        |

pub mod ast;
pub mod config;
pub mod engine;
pub mod error;
pub mod parser;
pub mod reader;
pub mod transpiler;
pub mod types;
pub mod validation;
pub mod writer;

#[cfg(test)]
mod testing;

pub mod prelude {
    pub use crate::ast::*;
    pub use crate::config::{EtlConfig, JobConfig};
    pub use crate::engine::{Connection, ConnectionSql, MemoryConnection, SqlxDriver, TxHandle};
    pub use crate::error::*;
    pub use crate::parser::{parse_filters, parse_sorts};
    pub use crate::reader::{MemoryReader, RowReader, SqlReader};
    pub use crate::transpiler::{CompiledQuery, Dialect, compile, compile_count};
    pub use crate::types::{Row, TypeCode, Value};
    pub use crate::validation::ValidatingReader;
    pub use crate::writer::{
        RunStatus, TargetAction, TransformWriter, WriterOptions, WriterResult, WriterTarget,
        write_all_records,
    };
}

pub use parser::{parse_filters, parse_sorts};
pub use transpiler::{compile, compile_count};
pub use writer::write_all_records;
