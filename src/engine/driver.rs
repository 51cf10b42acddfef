//! The database driver capability consumed by [`ConnectionSql`](super::ConnectionSql).

use crate::error::{EtlError, EtlResult};
use crate::transpiler::{CompiledQuery, Parameter};
use crate::types::{Row, Value};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// A statement plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sql: String,
    pub params: Vec<Parameter>,
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(sql: impl Into<String>, params: Vec<Parameter>) -> Self {
        Self {
            sql: sql.into(),
            params,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `fut` under this command's timeout.
    pub async fn timed<T>(&self, fut: impl Future<Output = EtlResult<T>>) -> EtlResult<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| EtlError::Timeout {
                    seconds: limit.as_secs(),
                })?,
            None => fut.await,
        }
    }
}

impl From<CompiledQuery> for Command {
    fn from(compiled: CompiledQuery) -> Self {
        Self::new(compiled.sql, compiled.params)
    }
}

/// One physical connection. Statements run inside the transaction opened
/// by `begin` until `commit` or `rollback`.
#[async_trait]
pub trait DbSession: Send {
    async fn begin(&mut self) -> EtlResult<()>;
    async fn commit(&mut self) -> EtlResult<()>;
    async fn rollback(&mut self) -> EtlResult<()>;
    /// Returns the affected row count.
    async fn execute(&mut self, command: &Command) -> EtlResult<u64>;
    async fn query(&mut self, command: &Command) -> EtlResult<Vec<Row>>;
    /// First column of the first row, `Null` when there is none.
    async fn scalar(&mut self, command: &Command) -> EtlResult<Value> {
        let rows = self.query(command).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(Value::Null))
    }
}

/// Rows streamed from a cursor running on its own connection.
pub struct RowStream {
    rx: mpsc::Receiver<EtlResult<Row>>,
}

impl RowStream {
    /// A stream fed through a bounded channel; the producer stops once the
    /// receiver is dropped.
    pub fn channel(capacity: usize) -> (mpsc::Sender<EtlResult<Row>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        let (tx, stream) = Self::channel(rows.len().max(1));
        for row in rows {
            if tx.try_send(Ok(row)).is_err() {
                break;
            }
        }
        stream
    }

    pub async fn next(&mut self) -> Option<EtlResult<Row>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;
    async fn open(&self) -> EtlResult<Box<dyn DbSession>>;
    async fn stream(&self, command: Command) -> EtlResult<RowStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_row_stream_from_rows() {
        let mut stream = RowStream::from_rows(vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        assert_eq!(stream.next().await.unwrap().unwrap(), vec![Value::Int(1)]);
        assert_eq!(stream.next().await.unwrap().unwrap(), vec![Value::Int(2)]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let command = Command::new("SELECT 1", vec![]).with_timeout(Some(Duration::from_millis(5)));
        let err = command
            .timed(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Timeout { .. }));
    }
}
