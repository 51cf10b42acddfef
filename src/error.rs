//! Error types for deltaflow.

use crate::types::TypeCode;
use thiserror::Error;

/// The main error type for deltaflow operations.
#[derive(Debug, Error)]
pub enum EtlError {
    /// The query model cannot be expressed as SQL.
    #[error("Compile error: {0}")]
    Compile(String),

    /// Failed to parse a filter or sort expression.
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    /// A driver or command failure, wrapped with the table/operation it hit.
    #[error("{context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A value could not be converted into its column's declared type.
    #[error("Conversion error on column '{column}' ({type_code:?}): {message}")]
    Conversion {
        column: String,
        type_code: TypeCode,
        message: String,
    },

    /// Unknown or already-finalized transaction handle.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Writer or reader used out of sequence.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing keys, unknown dialects, bad config files.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A command exceeded its timeout.
    #[error("Command timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// The operation observed its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid TOML config.
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EtlError {
    /// Create a compile error.
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile(message.into())
    }

    /// Create a parse error at the given position.
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    /// Wrap a lower-level failure with the operation that triggered it.
    pub fn connection<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Connection {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Create a conversion error.
    pub fn conversion(
        column: impl Into<String>,
        type_code: TypeCode,
        message: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            column: column.into(),
            type_code,
            message: message.into(),
        }
    }

    /// Prefix a connection error's context, leaving other kinds untouched.
    pub fn with_context(self, context: impl AsRef<str>) -> Self {
        match self {
            Self::Connection {
                context: inner,
                source,
            } => Self::Connection {
                context: format!("{}: {}", context.as_ref(), inner),
                source,
            },
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for deltaflow operations.
pub type EtlResult<T> = Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EtlError::parse(5, "unexpected character");
        assert_eq!(
            err.to_string(),
            "Parse error at position 5: unexpected character"
        );
    }

    #[test]
    fn test_connection_context() {
        let err = EtlError::connection("insert into orders", "socket closed")
            .with_context("flush create batch");
        assert_eq!(
            err.to_string(),
            "flush create batch: insert into orders: socket closed"
        );
    }

    #[test]
    fn test_conversion_display() {
        let err = EtlError::conversion("amount", TypeCode::Decimal, "'abc' is not a number");
        assert_eq!(
            err.to_string(),
            "Conversion error on column 'amount' (Decimal): 'abc' is not a number"
        );
    }
}
