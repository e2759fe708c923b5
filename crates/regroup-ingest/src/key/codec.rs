//! Binary layout of sortable keys
//!
//! Fields are written in schema order, big-endian:
//!
//! | type      | bytes                         |
//! |-----------|-------------------------------|
//! | string    | u32 length + UTF-8 bytes      |
//! | int32     | 4                             |
//! | int64     | 8                             |
//! | timestamp | 8 (epoch milliseconds, i64)   |
//!
//! Integers are stored as plain two's complement, so byte order matches
//! numeric order only for non-negative values.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{TimeZone, Timelike, Utc};

use super::{Schema, SortableKey, Value};
use crate::error::{IngestError, IngestResult};

/// Encode `key` against `schema` into a fresh buffer
pub fn encode(key: &SortableKey, schema: &Schema) -> IngestResult<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(schema.fixed_size() + 32);
    encode_into(key, schema, &mut buf)?;
    Ok(buf.to_vec())
}

/// Encode `key` into `buf`
///
/// The key is validated against the whole schema before the first byte is
/// written, so a failed call leaves `buf` untouched.
pub fn encode_into<B: BufMut>(key: &SortableKey, schema: &Schema, buf: &mut B) -> IngestResult<()> {
    let mut values = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        let value = key.get(&field.name).ok_or_else(|| {
            IngestError::encoding(format!("field '{}' has no value", field.name))
        })?;
        if value.field_type() != field.field_type {
            return Err(IngestError::encoding(format!(
                "field '{}' is declared {} but holds {}",
                field.name,
                field.field_type,
                value.field_type()
            )));
        }
        match value {
            Value::Str(s) if u32::try_from(s.len()).is_err() => {
                return Err(IngestError::encoding(format!(
                    "field '{}' is too long to encode ({} bytes)",
                    field.name,
                    s.len()
                )));
            },
            Value::Timestamp(ts) if ts.nanosecond() % 1_000_000 != 0 => {
                return Err(IngestError::encoding(format!(
                    "field '{}' holds {} with sub-millisecond precision",
                    field.name, ts
                )));
            },
            _ => {},
        }
        values.push(value);
    }

    for value in values {
        match value {
            Value::Str(s) => {
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            },
            Value::Int32(v) => buf.put_i32(*v),
            Value::Int64(v) => buf.put_i64(*v),
            Value::Timestamp(ts) => buf.put_i64(ts.timestamp_millis()),
        }
    }

    Ok(())
}

/// Decode bytes produced by [`encode`] with the same schema
pub fn decode(bytes: &[u8], schema: &Schema) -> IngestResult<SortableKey> {
    let mut cursor = bytes;
    let mut key = SortableKey::new();

    for field in schema.fields() {
        let truncated = |need: usize, have: usize| {
            IngestError::decoding(format!(
                "field '{}' needs {} bytes, {} left",
                field.name, need, have
            ))
        };

        let value = match field.field_type {
            super::FieldType::String => {
                if cursor.remaining() < 4 {
                    return Err(truncated(4, cursor.remaining()));
                }
                let len = cursor.get_u32() as usize;
                if cursor.remaining() < len {
                    return Err(truncated(len, cursor.remaining()));
                }
                let text = std::str::from_utf8(&cursor[..len]).map_err(|e| {
                    IngestError::decoding(format!("field '{}' is not UTF-8: {}", field.name, e))
                })?;
                let value = Value::Str(text.to_string());
                cursor.advance(len);
                value
            },
            super::FieldType::Int32 => {
                if cursor.remaining() < 4 {
                    return Err(truncated(4, cursor.remaining()));
                }
                Value::Int32(cursor.get_i32())
            },
            super::FieldType::Int64 => {
                if cursor.remaining() < 8 {
                    return Err(truncated(8, cursor.remaining()));
                }
                Value::Int64(cursor.get_i64())
            },
            super::FieldType::Timestamp => {
                if cursor.remaining() < 8 {
                    return Err(truncated(8, cursor.remaining()));
                }
                let millis = cursor.get_i64();
                let ts = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                    IngestError::decoding(format!(
                        "field '{}' holds out-of-range timestamp {}",
                        field.name, millis
                    ))
                })?;
                Value::Timestamp(ts)
            },
        };

        key = key.with(field.name.clone(), value);
    }

    if cursor.has_remaining() {
        return Err(IngestError::decoding(format!(
            "{} trailing bytes after last field",
            cursor.remaining()
        )));
    }

    Ok(key)
}
