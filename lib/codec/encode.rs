use byteorder::{LittleEndian, WriteBytesExt};

use super::{ColumnValue, RowHeader, Schema, METADATA_COLUMN_COUNT};

/// Writes row payloads in the layout [`super::decode_row`] reads.
///
/// Values are written as their own variant; callers pass values that match the
/// schema's column types. Values past the schema's column count are ignored.
pub struct RowEncoder {
    column_count: usize,
}

impl RowEncoder {
    pub fn new(schema: &Schema) -> Self {
        Self {
            column_count: schema.wire_column_count(),
        }
    }

    pub fn encode(&self, header: &RowHeader, values: &[ColumnValue]) -> Vec<u8> {
        let column_count = self.column_count;
        let values = &values[..values.len().min(column_count - METADATA_COLUMN_COUNT)];

        let mut buf = Vec::with_capacity(64);
        let count = u16::try_from(column_count).unwrap_or(u16::MAX);
        buf.extend_from_slice(&count.to_le_bytes());

        let mut null_bitmap = vec![0u8; column_count.div_ceil(8)];
        for (offset, value) in values.iter().enumerate() {
            if value.is_null() {
                let index = METADATA_COLUMN_COUNT + offset;
                null_bitmap[index / 8] |= 1 << (index % 8);
            }
        }
        buf.extend_from_slice(&null_bitmap);

        for field in [
            header.txn_id,
            header.timestamp,
            header.sequence,
            header.partition_column,
            header.site_id,
        ] {
            buf.extend_from_slice(&field.to_le_bytes());
        }
        buf.push(header.operation.code() as u8);

        for value in values {
            write_value(&mut buf, value);
        }
        buf
    }
}

fn write_value(buf: &mut Vec<u8>, value: &ColumnValue) {
    // Writes into a Vec cannot fail.
    let _ = match value {
        ColumnValue::Null => Ok(()),
        ColumnValue::TinyInt(v) => buf.write_i8(*v),
        ColumnValue::SmallInt(v) => buf.write_i16::<LittleEndian>(*v),
        ColumnValue::Integer(v) => buf.write_i32::<LittleEndian>(*v),
        ColumnValue::BigInt(v) | ColumnValue::Timestamp(v) => buf.write_i64::<LittleEndian>(*v),
        ColumnValue::Float(v) => buf.write_f64::<LittleEndian>(*v),
        ColumnValue::Decimal(v) => buf.write_i128::<LittleEndian>(*v),
        ColumnValue::Varchar(text) => write_len_prefixed(buf, text.as_bytes()),
        ColumnValue::Varbinary(bytes) => write_len_prefixed(buf, bytes),
    };
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> std::io::Result<()> {
    let length = i32::try_from(bytes.len()).unwrap_or(i32::MAX);
    buf.write_i32::<LittleEndian>(length)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Concatenates row payloads into a block buffer, each behind its `i32` length.
pub fn frame_rows(rows: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = rows.iter().map(|row| row.len() + 4).sum();
    let mut buf = Vec::with_capacity(total);
    for row in rows {
        let length = i32::try_from(row.len()).unwrap_or(i32::MAX);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(row);
    }
    buf
}
