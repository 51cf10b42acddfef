//! Compiler test modules.
//!
//! - `select`: projections, joins, grouping, filters across dialects
//! - `statements`: insert, update, delete and DDL

mod statements;
