//! SQL dialects as configuration records.

use crate::ast::{Column, Table};
use crate::error::{EtlError, EtlResult};
use crate::types::TypeCode;
use std::fmt;
use std::str::FromStr;

/// How bound parameters appear in SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `@where1Value2` / `:where1Value2`, by parameter name.
    Named(char),
    /// `$1`, `$2`, by position.
    Numbered,
    /// `?`, by position.
    Positional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// `... LIMIT n`
    Limit,
    /// `SELECT TOP n ...`
    Top,
    /// `... FETCH FIRST n ROWS ONLY`
    FetchFirst,
}

/// Everything the compiler needs to know about a target database.
#[derive(Clone)]
pub struct Dialect {
    pub name: &'static str,
    pub quote_open: char,
    pub quote_close: char,
    pub param_style: ParamStyle,
    pub limit_style: LimitStyle,
    /// Column type for DDL.
    pub type_name: fn(&Column) -> String,
    /// Column definition for a database-assigned identity.
    pub identity: &'static str,
    /// Query returning a count of tables named by the single parameter.
    pub table_exists: &'static str,
    /// `TRUNCATE TABLE` is available; otherwise truncation is a full delete.
    pub allows_truncate: bool,
    /// Array-typed columns can be filtered in SQL.
    pub supports_array_filters: bool,
    /// Most parameters accepted by a single command.
    pub max_parameters: usize,
    /// Largest SQL text sent in one command.
    pub max_sql_size: usize,
}

impl fmt::Debug for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialect").field("name", &self.name).finish()
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Self::postgres()
    }
}

impl PartialEq for Dialect {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Dialect {
    pub fn postgres() -> Self {
        Self {
            name: "postgres",
            quote_open: '"',
            quote_close: '"',
            param_style: ParamStyle::Numbered,
            limit_style: LimitStyle::Limit,
            type_name: postgres_type,
            identity: "BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
            table_exists: "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1",
            allows_truncate: true,
            supports_array_filters: false,
            max_parameters: 32767,
            max_sql_size: 4_000_000,
        }
    }

    pub fn sqlite() -> Self {
        Self {
            name: "sqlite",
            quote_open: '"',
            quote_close: '"',
            param_style: ParamStyle::Positional,
            limit_style: LimitStyle::Limit,
            type_name: sqlite_type,
            identity: "INTEGER PRIMARY KEY AUTOINCREMENT",
            table_exists: "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            allows_truncate: false,
            supports_array_filters: false,
            max_parameters: 999,
            max_sql_size: 1_000_000,
        }
    }

    pub fn mysql() -> Self {
        Self {
            name: "mysql",
            quote_open: '`',
            quote_close: '`',
            param_style: ParamStyle::Positional,
            limit_style: LimitStyle::Limit,
            type_name: mysql_type,
            identity: "BIGINT AUTO_INCREMENT PRIMARY KEY",
            table_exists: "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
            allows_truncate: true,
            supports_array_filters: false,
            max_parameters: 65535,
            max_sql_size: 4_000_000,
        }
    }

    pub fn sqlserver() -> Self {
        Self {
            name: "sqlserver",
            quote_open: '[',
            quote_close: ']',
            param_style: ParamStyle::Named('@'),
            limit_style: LimitStyle::Top,
            type_name: sqlserver_type,
            identity: "BIGINT IDENTITY(1,1) PRIMARY KEY",
            table_exists: "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = @name",
            allows_truncate: true,
            supports_array_filters: false,
            max_parameters: 2100,
            max_sql_size: 4_000_000,
        }
    }

    /// Pick a dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> EtlResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Self::postgres()),
            "sqlite" => Ok(Self::sqlite()),
            "mysql" | "mariadb" => Ok(Self::mysql()),
            "mssql" | "sqlserver" => Ok(Self::sqlserver()),
            other => Err(EtlError::Config(format!("no dialect for url scheme '{}'", other))),
        }
    }

    /// Quote an identifier, doubling any closing delimiter inside it.
    pub fn quote(&self, identifier: &str) -> String {
        let close = self.quote_close.to_string();
        let escaped = identifier.replace(self.quote_close, &format!("{}{}", close, close));
        format!("{}{}{}", self.quote_open, escaped, self.quote_close)
    }

    /// `schema.table` or `table`, quoted.
    pub fn table_name(&self, table: &Table) -> String {
        match &table.schema {
            Some(schema) => format!("{}.{}", self.quote(schema), self.quote(&table.name)),
            None => self.quote(&table.name),
        }
    }

    /// Placeholder text for a parameter. `position` is 1-based.
    ///
    /// Numbered placeholders carry a cast for types that are bound as text.
    pub fn placeholder(&self, name: &str, position: usize, type_code: TypeCode) -> String {
        match self.param_style {
            ParamStyle::Named(prefix) => format!("{}{}", prefix, name),
            ParamStyle::Numbered => format!("${}{}", position, text_cast(type_code)),
            ParamStyle::Positional => "?".to_string(),
        }
    }
}

impl FromStr for Dialect {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::postgres()),
            "sqlite" => Ok(Self::sqlite()),
            "mysql" | "mariadb" => Ok(Self::mysql()),
            "sqlserver" | "mssql" => Ok(Self::sqlserver()),
            other => Err(EtlError::Config(format!("unknown dialect '{}'", other))),
        }
    }
}

fn text_cast(type_code: TypeCode) -> &'static str {
    match type_code {
        TypeCode::Decimal => "::numeric",
        TypeCode::DateTime => "::timestamp",
        TypeCode::Date => "::date",
        TypeCode::Time => "::time",
        TypeCode::Guid => "::uuid",
        TypeCode::Json => "::jsonb",
        _ => "",
    }
}

fn varchar(column: &Column, unbounded: &str) -> String {
    match column.effective_max_length() {
        Some(n) => format!("VARCHAR({})", n),
        None => unbounded.to_string(),
    }
}

fn decimal(column: &Column) -> String {
    format!(
        "DECIMAL({},{})",
        column.precision.unwrap_or(28),
        column.scale.unwrap_or(column.precision.map(|_| 0).unwrap_or(8))
    )
}

fn postgres_type(column: &Column) -> String {
    let base = match column.data_type() {
        TypeCode::String | TypeCode::Unknown => varchar(column, "TEXT"),
        TypeCode::Char => format!("CHAR({})", column.effective_max_length().unwrap_or(1)),
        TypeCode::Boolean => "BOOLEAN".into(),
        TypeCode::Int16 => "SMALLINT".into(),
        TypeCode::Int32 => "INTEGER".into(),
        TypeCode::Int64 | TypeCode::UInt64 => "BIGINT".into(),
        TypeCode::Double => "DOUBLE PRECISION".into(),
        TypeCode::Decimal => decimal(column),
        TypeCode::DateTime => "TIMESTAMP".into(),
        TypeCode::Date => "DATE".into(),
        TypeCode::Time => "TIME".into(),
        TypeCode::Guid => "UUID".into(),
        TypeCode::Binary => "BYTEA".into(),
        TypeCode::Json => "JSONB".into(),
    };
    if column.is_array() {
        format!("{}{}", base, "[]".repeat(column.rank as usize))
    } else {
        base
    }
}

fn sqlite_type(column: &Column) -> String {
    match column.data_type() {
        TypeCode::Boolean
        | TypeCode::Int16
        | TypeCode::Int32
        | TypeCode::Int64
        | TypeCode::UInt64 => "INTEGER".into(),
        TypeCode::Double => "REAL".into(),
        TypeCode::Decimal => "NUMERIC".into(),
        TypeCode::Binary => "BLOB".into(),
        _ => "TEXT".into(),
    }
}

fn mysql_type(column: &Column) -> String {
    match column.data_type() {
        TypeCode::String | TypeCode::Unknown => varchar(column, "TEXT"),
        TypeCode::Char => format!("CHAR({})", column.effective_max_length().unwrap_or(1)),
        TypeCode::Boolean => "TINYINT(1)".into(),
        TypeCode::Int16 => "SMALLINT".into(),
        TypeCode::Int32 => "INT".into(),
        TypeCode::Int64 => "BIGINT".into(),
        TypeCode::UInt64 => "BIGINT UNSIGNED".into(),
        TypeCode::Double => "DOUBLE".into(),
        TypeCode::Decimal => decimal(column),
        TypeCode::DateTime => "DATETIME(6)".into(),
        TypeCode::Date => "DATE".into(),
        TypeCode::Time => "TIME(6)".into(),
        TypeCode::Guid => "CHAR(36)".into(),
        TypeCode::Binary => "LONGBLOB".into(),
        TypeCode::Json => "JSON".into(),
    }
}

fn sqlserver_type(column: &Column) -> String {
    match column.data_type() {
        TypeCode::String | TypeCode::Unknown => match column.effective_max_length() {
            Some(n) => format!("NVARCHAR({})", n),
            None => "NVARCHAR(MAX)".into(),
        },
        TypeCode::Char => format!("NCHAR({})", column.effective_max_length().unwrap_or(1)),
        TypeCode::Boolean => "BIT".into(),
        TypeCode::Int16 => "SMALLINT".into(),
        TypeCode::Int32 => "INT".into(),
        TypeCode::Int64 | TypeCode::UInt64 => "BIGINT".into(),
        TypeCode::Double => "FLOAT".into(),
        TypeCode::Decimal => decimal(column),
        TypeCode::DateTime => "DATETIME2".into(),
        TypeCode::Date => "DATE".into(),
        TypeCode::Time => "TIME".into(),
        TypeCode::Guid => "UNIQUEIDENTIFIER".into(),
        TypeCode::Binary => "VARBINARY(MAX)".into(),
        TypeCode::Json => "NVARCHAR(MAX)".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes_delimiter() {
        assert_eq!(Dialect::postgres().quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::sqlserver().quote("order"), "[order]");
        assert_eq!(Dialect::mysql().quote("x`y"), "`x``y`");
    }

    #[test]
    fn test_placeholders() {
        let pg = Dialect::postgres();
        assert_eq!(pg.placeholder("where1Value2", 3, TypeCode::Int64), "$3");
        assert_eq!(pg.placeholder("where1Value2", 3, TypeCode::Decimal), "$3::numeric");
        assert_eq!(Dialect::sqlite().placeholder("where1Value2", 3, TypeCode::Decimal), "?");
        assert_eq!(
            Dialect::sqlserver().placeholder("where1Value2", 3, TypeCode::Int64),
            "@where1Value2"
        );
    }

    #[test]
    fn test_from_str_and_url() {
        assert_eq!("PG".parse::<Dialect>().unwrap().name, "postgres");
        assert!("oracle".parse::<Dialect>().is_err());
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap().name, "sqlite");
        assert_eq!(Dialect::from_url("mysql://localhost/db").unwrap().name, "mysql");
    }

    #[test]
    fn test_type_names() {
        let pg = Dialect::postgres();
        let name = Column::new("name", TypeCode::String).max_length(50);
        assert_eq!((pg.type_name)(&name), "VARCHAR(50)");
        let tags = Column::new("tags", TypeCode::String).array(1);
        assert_eq!((pg.type_name)(&tags), "TEXT[]");
        let mut amount = Column::new("amount", TypeCode::Decimal);
        amount.precision = Some(10);
        amount.scale = Some(2);
        assert_eq!((Dialect::sqlserver().type_name)(&amount), "DECIMAL(10,2)");
    }
}
