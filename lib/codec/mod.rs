//! Typed rows decoded from export blocks.
//!
//! A block buffer is a run of little-endian `i32` length-prefixed row payloads (see
//! [`RowFrames`]). Each payload is decoded against the generation-tagged [`Schema`] the
//! block was written under.

mod decode;
mod encode;

pub use decode::{decode_row, RowFrames};
pub use encode::{frame_rows, RowEncoder};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Number of metadata columns every export row starts with.
pub const METADATA_COLUMN_COUNT: usize = 6;

/// Names of the metadata columns, in wire order.
pub const METADATA_COLUMN_NAMES: [&str; METADATA_COLUMN_COUNT] = [
    "TXN_ID",
    "TIMESTAMP",
    "SEQUENCE",
    "PARTITION_ID",
    "SITE_ID",
    "OPERATION",
];

/// Fixed scale of DECIMAL values.
pub const DECIMAL_SCALE: u32 = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("row payload truncated while reading {0}")]
    Truncated(&'static str),

    #[error("invalid row length prefix {length} at offset {offset}")]
    InvalidLength { length: i32, offset: usize },

    #[error("row has {actual} columns but schema {table} generation {generation} expects {expected}")]
    ColumnCountMismatch {
        table: String,
        generation: u64,
        expected: usize,
        actual: usize,
    },

    #[error("metadata column {0} is null")]
    NullMetadata(&'static str),

    #[error("unknown row operation {0}")]
    UnknownOperation(i8),

    #[error("column {column} is not valid UTF-8")]
    InvalidUtf8 { column: String },

    #[error("{0} trailing bytes after last column")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Timestamp,
    Decimal,
    Varchar,
    Varbinary,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TinyInt => "TINYINT",
            Self::SmallInt => "SMALLINT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Float => "FLOAT",
            Self::Timestamp => "TIMESTAMP",
            Self::Decimal => "DECIMAL",
            Self::Varchar => "VARCHAR",
            Self::Varbinary => "VARBINARY",
        }
    }
}

/// One decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Float(f64),
    /// Microseconds since the unix epoch.
    Timestamp(i64),
    /// Unscaled value, scale [`DECIMAL_SCALE`].
    Decimal(i128),
    Varchar(String),
    Varbinary(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view of the integral variants.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::TinyInt(v) => Some(i64::from(*v)),
            Self::SmallInt(v) => Some(i64::from(*v)),
            Self::Integer(v) => Some(i64::from(*v)),
            Self::BigInt(v) | Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::TinyInt(v) => write!(f, "{v}"),
            Self::SmallInt(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{v}"),
            Self::Decimal(v) => {
                let divisor = 10u128.pow(DECIMAL_SCALE);
                let magnitude = v.unsigned_abs();
                let sign = if *v < 0 { "-" } else { "" };
                write!(
                    f,
                    "{sign}{}.{:0width$}",
                    magnitude / divisor,
                    magnitude % divisor,
                    width = DECIMAL_SCALE as usize
                )
            }
            Self::Varchar(v) => f.write_str(v),
            Self::Varbinary(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Column layout of one table version. The metadata columns are implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub table_name: String,
    pub generation: u64,
    pub columns: Vec<ColumnInfo>,
}

impl Schema {
    pub fn new(table_name: impl Into<String>, generation: u64, columns: Vec<ColumnInfo>) -> Self {
        Self {
            table_name: table_name.into(),
            generation,
            columns,
        }
    }

    /// Column count on the wire, metadata included.
    pub fn wire_column_count(&self) -> usize {
        METADATA_COLUMN_COUNT + self.columns.len()
    }
}

/// Kind of change a row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOperation {
    Insert,
    Delete,
    UpdateBefore,
    UpdateAfter,
    Migrate,
}

impl RowOperation {
    pub fn from_code(code: i8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(Self::Insert),
            2 => Ok(Self::Delete),
            3 => Ok(Self::UpdateBefore),
            4 => Ok(Self::UpdateAfter),
            5 => Ok(Self::Migrate),
            other => Err(DecodeError::UnknownOperation(other)),
        }
    }

    pub fn code(self) -> i8 {
        match self {
            Self::Insert => 1,
            Self::Delete => 2,
            Self::UpdateBefore => 3,
            Self::UpdateAfter => 4,
            Self::Migrate => 5,
        }
    }
}

/// Values of the six metadata columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowHeader {
    pub txn_id: i64,
    /// Microseconds since the unix epoch.
    pub timestamp: i64,
    pub sequence: i64,
    pub partition_column: i64,
    pub site_id: i64,
    pub operation: RowOperation,
}

/// One decoded row, plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub schema: Arc<Schema>,
    pub partition_id: i32,
    pub header: RowHeader,
    /// User columns, in schema order.
    pub values: Vec<ColumnValue>,
}

impl ExportRow {
    pub fn table_name(&self) -> &str {
        &self.schema.table_name
    }

    pub fn generation(&self) -> u64 {
        self.schema.generation
    }

    /// Metadata columns rendered as values, in wire order.
    pub fn metadata_values(&self) -> [ColumnValue; METADATA_COLUMN_COUNT] {
        [
            ColumnValue::BigInt(self.header.txn_id),
            ColumnValue::Timestamp(self.header.timestamp),
            ColumnValue::BigInt(self.header.sequence),
            ColumnValue::BigInt(self.header.partition_column),
            ColumnValue::BigInt(self.header.site_id),
            ColumnValue::TinyInt(self.header.operation.code()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnType, ColumnValue, RowOperation};

    #[test]
    fn decimal_display_keeps_twelve_digit_scale() {
        assert_eq!(
            ColumnValue::Decimal(1_500_000_000_000).to_string(),
            "1.500000000000"
        );
        assert_eq!(ColumnValue::Decimal(-5).to_string(), "-0.000000000005");
    }

    #[test]
    fn varbinary_displays_as_upper_hex() {
        assert_eq!(ColumnValue::Varbinary(vec![0x0a, 0xff]).to_string(), "0AFF");
    }

    #[test]
    fn column_type_serializes_as_sql_name() {
        let json = serde_json::to_string(&ColumnType::BigInt).expect("serialize column type");
        assert_eq!(json, "\"BIGINT\"");
        assert_eq!(ColumnType::BigInt.as_str(), "BIGINT");
    }

    #[test]
    fn unknown_operation_code_is_rejected() {
        assert!(RowOperation::from_code(9).is_err());
        assert_eq!(
            RowOperation::from_code(RowOperation::UpdateAfter.code()),
            Ok(RowOperation::UpdateAfter)
        );
    }
}
