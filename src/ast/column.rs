//! Column definitions and their roles in delta processing.

use crate::error::{EtlError, EtlResult};
use crate::types::{Numeric, TypeCode, Value};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role a column plays when rows are compared, keyed and audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    SurrogateKey,
    SourceSurrogateKey,
    NaturalKey,
    #[default]
    TrackingField,
    NonTrackingField,
    IgnoreField,
    ValidFromDate,
    ValidToDate,
    CreateDate,
    UpdateDate,
    CreateAuditKey,
    UpdateAuditKey,
    IsCurrentField,
    ValidationStatus,
    RejectedReason,
    FileName,
    RowKey,
    PartitionKey,
    TimeStamp,
    DatabaseOperation,
    /// Incremented in-process by the writer.
    AutoIncrement,
    /// Assigned by the database on insert.
    DbAutoIncrement,
}

/// Encryption/hashing state of a column's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityFlag {
    #[default]
    None,
    FastEncrypt,
    FastDecrypt,
    StrongEncrypt,
    StrongDecrypt,
    OneWayHash,
    FastEncrypted,
    StrongEncrypted,
    OneWayHashed,
}

const SECURED_MAX_LENGTH: u32 = 250;

/// A column of a table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Column {
    pub name: String,
    pub logical_name: Option<String>,
    pub description: Option<String>,
    /// Base type, before security flags are applied. See [`Column::data_type`].
    #[serde(rename = "data_type")]
    pub base_type: TypeCode,
    #[serde(rename = "max_length")]
    pub base_max_length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    /// 0 for scalars, array depth otherwise.
    pub rank: u32,
    pub allow_db_null: bool,
    pub delta_type: DeltaType,
    pub default_value: Option<String>,
    pub is_unique: bool,
    pub is_mandatory: bool,
    pub is_input: bool,
    pub security_flag: SecurityFlag,
    pub format: Option<String>,
    /// Table or alias this column belongs to in a joined query.
    pub reference_table: Option<String>,
    pub child_columns: Option<Arc<Vec<Column>>>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: TypeCode) -> Self {
        Self {
            name: name.into(),
            base_type: data_type,
            allow_db_null: true,
            ..Default::default()
        }
    }

    /// A column typed by the default for its role.
    pub fn with_role(name: impl Into<String>, delta_type: DeltaType) -> Self {
        let mut column = Self::new(name, Self::default_data_type(delta_type));
        column.delta_type = delta_type;
        column.allow_db_null = !matches!(
            delta_type,
            DeltaType::SurrogateKey | DeltaType::AutoIncrement | DeltaType::DbAutoIncrement
        );
        column
    }

    pub fn delta(mut self, delta_type: DeltaType) -> Self {
        self.delta_type = delta_type;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.allow_db_null = false;
        self
    }

    pub fn max_length(mut self, length: u32) -> Self {
        self.base_max_length = Some(length);
        self
    }

    /// Mark as an input column whose default is passed through as a filter.
    pub fn input(mut self, default: impl Into<String>) -> Self {
        self.is_input = true;
        self.default_value = Some(default.into());
        self
    }

    pub fn default_value(mut self, default: impl Into<String>) -> Self {
        self.default_value = Some(default.into());
        self
    }

    pub fn reference(mut self, table: impl Into<String>) -> Self {
        self.reference_table = Some(table.into());
        self
    }

    pub fn array(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn security(mut self, flag: SecurityFlag) -> Self {
        self.security_flag = flag;
        self
    }

    pub fn children(mut self, columns: Vec<Column>) -> Self {
        self.child_columns = Some(Arc::new(columns));
        self
    }

    /// Effective type: secured values travel as strings.
    pub fn data_type(&self) -> TypeCode {
        if self.is_secured() {
            TypeCode::String
        } else {
            self.base_type
        }
    }

    pub fn effective_max_length(&self) -> Option<u32> {
        if self.is_secured() {
            Some(SECURED_MAX_LENGTH)
        } else {
            self.base_max_length
        }
    }

    fn is_secured(&self) -> bool {
        !matches!(
            self.security_flag,
            SecurityFlag::None | SecurityFlag::FastDecrypt | SecurityFlag::StrongDecrypt
        )
    }

    pub fn is_array(&self) -> bool {
        self.rank > 0
    }

    pub fn is_auto_increment(&self) -> bool {
        matches!(
            self.delta_type,
            DeltaType::AutoIncrement | DeltaType::DbAutoIncrement
        )
    }

    /// Natural keys and tracked fields: columns that come from the source.
    pub fn is_source_column(&self) -> bool {
        matches!(
            self.delta_type,
            DeltaType::NaturalKey | DeltaType::TrackingField | DeltaType::NonTrackingField
        )
    }

    /// Audit columns that are populated without a mapping.
    pub fn is_generated_column(&self) -> bool {
        matches!(
            self.delta_type,
            DeltaType::CreateAuditKey
                | DeltaType::UpdateAuditKey
                | DeltaType::CreateDate
                | DeltaType::UpdateDate
                | DeltaType::AutoIncrement
                | DeltaType::DbAutoIncrement
                | DeltaType::ValidationStatus
        )
    }

    pub fn is_current_column(&self) -> bool {
        matches!(
            self.delta_type,
            DeltaType::ValidFromDate | DeltaType::ValidToDate | DeltaType::IsCurrentField
        )
    }

    /// Has a nested row structure.
    pub fn is_parent(&self) -> bool {
        self.child_columns.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Default value, converted to the column type. Blank defaults are `None`.
    pub fn typed_default(&self) -> EtlResult<Option<Value>> {
        match self.default_value.as_deref() {
            Some(text) if !text.trim().is_empty() => self.convert(&Value::from(text)).map(Some),
            _ => Ok(None),
        }
    }

    /// Convert a value into this column's type, checking nullability and length.
    pub fn convert(&self, value: &Value) -> EtlResult<Value> {
        if self.is_parent() {
            return Ok(value.clone());
        }
        let converted = value
            .convert(self.data_type())
            .map_err(|message| EtlError::conversion(&self.name, self.data_type(), message))?;
        if let (Some(max), Value::String(s)) = (self.effective_max_length(), &converted) {
            if s.chars().count() > max as usize {
                return Err(EtlError::conversion(
                    &self.name,
                    self.data_type(),
                    format!("value length {} exceeds maximum {}", s.chars().count(), max),
                ));
            }
        }
        Ok(converted)
    }

    /// A copy for use in a derived table. Pending encryption becomes the
    /// completed state; child definitions are shared, not duplicated.
    pub fn copy(&self, include_children: bool) -> Self {
        let security_flag = match self.security_flag {
            SecurityFlag::FastEncrypt => SecurityFlag::FastEncrypted,
            SecurityFlag::StrongEncrypt => SecurityFlag::StrongEncrypted,
            SecurityFlag::OneWayHash => SecurityFlag::OneWayHashed,
            other => other,
        };
        Self {
            security_flag,
            child_columns: if include_children {
                self.child_columns.clone()
            } else {
                None
            },
            ..self.clone()
        }
    }

    pub fn default_data_type(delta_type: DeltaType) -> TypeCode {
        match delta_type {
            DeltaType::AutoIncrement
            | DeltaType::SourceSurrogateKey
            | DeltaType::CreateAuditKey
            | DeltaType::UpdateAuditKey => TypeCode::UInt64,
            DeltaType::SurrogateKey | DeltaType::DbAutoIncrement => TypeCode::Int64,
            DeltaType::ValidFromDate
            | DeltaType::ValidToDate
            | DeltaType::CreateDate
            | DeltaType::UpdateDate
            | DeltaType::TimeStamp => TypeCode::DateTime,
            DeltaType::IsCurrentField => TypeCode::Boolean,
            _ => TypeCode::String,
        }
    }

    /// Fill in a display format from the type when none is set.
    pub fn reset_format(&mut self, force: bool) {
        if !force && self.format.is_some() {
            return;
        }
        match self.base_type {
            t if t.is_integer() => {
                if matches!(
                    self.delta_type,
                    DeltaType::TrackingField | DeltaType::NonTrackingField
                ) {
                    self.format = Some("#,##0".into());
                }
            }
            TypeCode::Double | TypeCode::Decimal => {
                self.format = Some(match self.precision {
                    Some(p) => format!("#,##0.{}", "0".repeat(p as usize)),
                    None => "#,##0.####".into(),
                });
            }
            _ => {}
        }
    }

    /// Render a value with the column's display format.
    ///
    /// Numeric formats follow the `#,##0.00` convention: `0` is a required
    /// digit, `#` an optional one. Date formats are chrono strftime patterns.
    pub fn format_value(&self, value: &Value) -> String {
        let Some(format) = self.format.as_deref() else {
            return value.to_string();
        };
        match value {
            Value::DateTime(d) if format.contains('%') => d.format(format).to_string(),
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => {
                match Numeric::from_value(value) {
                    Some(n) if format.contains('0') || format.contains('#') => {
                        format_number(n, format)
                    }
                    _ => value.to_string(),
                }
            }
            other => other.to_string(),
        }
    }
}

fn format_number(value: Numeric, format: &str) -> String {
    let (int_part, frac_part) = format.split_once('.').unwrap_or((format, ""));
    let required = frac_part.chars().filter(|c| *c == '0').count() as u32;
    let optional = frac_part.chars().filter(|c| *c == '#').count() as u32;
    let grouping = int_part.contains(',');

    let decimal = match value {
        Numeric::Int(v) => Decimal::from(v),
        Numeric::Decimal(d) => d,
        Numeric::Float(f) => match Decimal::try_from(f) {
            Ok(d) => d,
            Err(_) => return f.to_string(),
        },
    };
    let rounded = decimal.round_dp(required + optional);
    let mut text = format!("{:.*}", (required + optional) as usize, rounded.abs());
    if optional > 0 {
        let keep = text.find('.').map(|p| p + 1 + required as usize).unwrap_or(text.len());
        while text.len() > keep && text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }

    let (whole, fraction) = match text.split_once('.') {
        Some((w, f)) => (w.to_string(), format!(".{}", f)),
        None => (text.clone(), String::new()),
    };
    let whole = if grouping { group_thousands(&whole) } else { whole };
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{}{}{}", sign, whole, fraction)
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
