use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;

use super::{
    ColumnType, ColumnValue, DecodeError, ExportRow, RowHeader, RowOperation, Schema,
    METADATA_COLUMN_COUNT, METADATA_COLUMN_NAMES,
};

/// Walks the length-prefixed row payloads of one block buffer.
///
/// Yields an error (and then stops) when a length prefix is negative or runs past the
/// end of the buffer.
pub struct RowFrames<'a> {
    data: &'a [u8],
    position: usize,
    failed: bool,
}

impl<'a> RowFrames<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            failed: false,
        }
    }

    /// Offset of the next length prefix.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl<'a> Iterator for RowFrames<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.data.len() {
            return None;
        }

        let offset = self.position;
        let remaining = &self.data[offset..];
        if remaining.len() < 4 {
            self.failed = true;
            return Some(Err(DecodeError::Truncated("row length prefix")));
        }

        let length = i32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]);
        let end = usize::try_from(length)
            .ok()
            .and_then(|len| (offset + 4).checked_add(len))
            .filter(|end| *end <= self.data.len());

        match end {
            Some(end) => {
                self.position = end;
                Some(Ok(&self.data[offset + 4..end]))
            }
            None => {
                self.failed = true;
                Some(Err(DecodeError::InvalidLength { length, offset }))
            }
        }
    }
}

/// Decodes one row payload under `schema`.
pub fn decode_row(
    schema: &Arc<Schema>,
    partition_id: i32,
    bytes: &[u8],
) -> Result<ExportRow, DecodeError> {
    let mut cursor = Cursor::new(bytes);

    let column_count = usize::from(
        cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated("column count"))?,
    );
    if column_count != schema.wire_column_count() {
        return Err(DecodeError::ColumnCountMismatch {
            table: schema.table_name.clone(),
            generation: schema.generation,
            expected: schema.wire_column_count(),
            actual: column_count,
        });
    }

    let mut null_bitmap = vec![0u8; column_count.div_ceil(8)];
    cursor
        .read_exact(&mut null_bitmap)
        .map_err(|_| DecodeError::Truncated("null bitmap"))?;
    let is_null = |index: usize| null_bitmap[index / 8] & (1 << (index % 8)) != 0;

    for (index, name) in METADATA_COLUMN_NAMES.iter().enumerate() {
        if is_null(index) {
            return Err(DecodeError::NullMetadata(*name));
        }
    }

    let txn_id = read_i64(&mut cursor, "TXN_ID")?;
    let timestamp = read_i64(&mut cursor, "TIMESTAMP")?;
    let sequence = read_i64(&mut cursor, "SEQUENCE")?;
    let partition_column = read_i64(&mut cursor, "PARTITION_ID")?;
    let site_id = read_i64(&mut cursor, "SITE_ID")?;
    let operation = RowOperation::from_code(
        cursor
            .read_i8()
            .map_err(|_| DecodeError::Truncated("OPERATION"))?,
    )?;

    let mut values = Vec::with_capacity(schema.columns.len());
    for (offset, column) in schema.columns.iter().enumerate() {
        if is_null(METADATA_COLUMN_COUNT + offset) {
            values.push(ColumnValue::Null);
            continue;
        }
        values.push(read_value(&mut cursor, column.column_type, &column.name)?);
    }

    let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    if consumed < bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - consumed));
    }

    Ok(ExportRow {
        schema: schema.clone(),
        partition_id,
        header: RowHeader {
            txn_id,
            timestamp,
            sequence,
            partition_column,
            site_id,
            operation,
        },
        values,
    })
}

fn read_i64(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<i64, DecodeError> {
    cursor
        .read_i64::<LittleEndian>()
        .map_err(|_| DecodeError::Truncated(what))
}

fn read_len_prefixed(cursor: &mut Cursor<&[u8]>, column: &str) -> Result<Vec<u8>, DecodeError> {
    let length = cursor
        .read_i32::<LittleEndian>()
        .map_err(|_| DecodeError::Truncated("variable-length column prefix"))?;
    let length = usize::try_from(length).map_err(|_| DecodeError::InvalidLength {
        length,
        offset: usize::try_from(cursor.position()).unwrap_or(usize::MAX),
    })?;

    let position = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    let available = cursor.get_ref().len().saturating_sub(position);
    if length > available {
        tracing::trace!(column, length, available, "variable-length column overruns row");
        return Err(DecodeError::Truncated("variable-length column body"));
    }

    let mut body = vec![0u8; length];
    cursor
        .read_exact(&mut body)
        .map_err(|_| DecodeError::Truncated("variable-length column body"))?;
    Ok(body)
}

fn read_value(
    cursor: &mut Cursor<&[u8]>,
    column_type: ColumnType,
    column: &str,
) -> Result<ColumnValue, DecodeError> {
    let truncated = |_| DecodeError::Truncated("column value");
    let value = match column_type {
        ColumnType::TinyInt => ColumnValue::TinyInt(cursor.read_i8().map_err(truncated)?),
        ColumnType::SmallInt => {
            ColumnValue::SmallInt(cursor.read_i16::<LittleEndian>().map_err(truncated)?)
        }
        ColumnType::Integer => {
            ColumnValue::Integer(cursor.read_i32::<LittleEndian>().map_err(truncated)?)
        }
        ColumnType::BigInt => {
            ColumnValue::BigInt(cursor.read_i64::<LittleEndian>().map_err(truncated)?)
        }
        ColumnType::Float => {
            ColumnValue::Float(cursor.read_f64::<LittleEndian>().map_err(truncated)?)
        }
        ColumnType::Timestamp => {
            ColumnValue::Timestamp(cursor.read_i64::<LittleEndian>().map_err(truncated)?)
        }
        ColumnType::Decimal => {
            ColumnValue::Decimal(cursor.read_i128::<LittleEndian>().map_err(truncated)?)
        }
        ColumnType::Varchar => {
            let body = read_len_prefixed(cursor, column)?;
            let text = String::from_utf8(body).map_err(|_| DecodeError::InvalidUtf8 {
                column: column.to_string(),
            })?;
            ColumnValue::Varchar(text)
        }
        ColumnType::Varbinary => ColumnValue::Varbinary(read_len_prefixed(cursor, column)?),
    };
    Ok(value)
}
