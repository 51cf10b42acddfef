//! Execution: drivers, transactions and the connections built on them.

pub mod connection;
pub mod driver;
pub mod evaluate;
pub mod memory;
pub mod sqlx_driver;
pub mod transaction;

pub use connection::{Connection, ConnectionSql, InsertOutcome};
pub use driver::{Command, DbSession, Driver, RowStream};
pub use memory::MemoryConnection;
pub use sqlx_driver::SqlxDriver;
pub use transaction::{Scope, TransactionStore, TxHandle};
