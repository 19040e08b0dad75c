//! Length-prefixed byte codec for row sets and parameter sets.
//!
//! Work results carry their dependency payloads as independently decodable
//! byte strings, so each row set serializes to one self-contained buffer.

use hornet_common::error::{HornetError, HornetResult};

use crate::value::{ParameterSet, RowSet, Value};

const TAG_NULL: u8 = 0;
const TAG_BIGINT: u8 = 1;
const TAG_VARCHAR: u8 = 2;
const TAG_VARBINARY: u8 = 3;

/// Encodes one row set into a self-contained buffer.
#[must_use]
pub fn encode_row_set(rows: &RowSet) -> Vec<u8> {
    let mut payload = Vec::new();
    write_u32(&mut payload, rows.rows.len() as u32);
    for row in &rows.rows {
        write_u32(&mut payload, row.len() as u32);
        for value in row {
            write_value(&mut payload, value);
        }
    }
    payload
}

/// Decodes one row set from a buffer produced by [`encode_row_set`].
///
/// # Errors
///
/// Returns `HornetError::Codec` when the payload is truncated or carries an
/// unknown value tag.
pub fn decode_row_set(payload: &[u8]) -> HornetResult<RowSet> {
    let mut cursor = Cursor::new(payload);
    let row_count = cursor.read_u32()? as usize;
    let mut rows = Vec::with_capacity(row_count.min(1024));
    for _ in 0..row_count {
        let field_count = cursor.read_u32()? as usize;
        let mut row = Vec::with_capacity(field_count.min(64));
        for _ in 0..field_count {
            row.push(cursor.read_value()?);
        }
        rows.push(row);
    }
    cursor.finish()?;
    Ok(RowSet { rows })
}

/// Encodes one parameter set into a self-contained buffer.
#[must_use]
pub fn encode_parameter_set(params: &ParameterSet) -> Vec<u8> {
    let mut payload = Vec::new();
    write_u32(&mut payload, params.values.len() as u32);
    for value in &params.values {
        write_value(&mut payload, value);
    }
    payload
}

/// Decodes one parameter set from a buffer produced by [`encode_parameter_set`].
///
/// # Errors
///
/// Returns `HornetError::Codec` when the payload is truncated or carries an
/// unknown value tag.
pub fn decode_parameter_set(payload: &[u8]) -> HornetResult<ParameterSet> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32()? as usize;
    let mut values = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        values.push(cursor.read_value()?);
    }
    cursor.finish()?;
    Ok(ParameterSet::new(values))
}

fn write_u32(payload: &mut Vec<u8>, value: u32) {
    payload.extend_from_slice(&value.to_le_bytes());
}

fn write_value(payload: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => payload.push(TAG_NULL),
        Value::BigInt(number) => {
            payload.push(TAG_BIGINT);
            payload.extend_from_slice(&number.to_le_bytes());
        }
        Value::Varchar(text) => {
            payload.push(TAG_VARCHAR);
            write_u32(payload, text.len() as u32);
            payload.extend_from_slice(text.as_bytes());
        }
        Value::Varbinary(bytes) => {
            payload.push(TAG_VARBINARY);
            write_u32(payload, bytes.len() as u32);
            payload.extend_from_slice(bytes);
        }
    }
}

struct Cursor<'a> {
    payload: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            position: 0,
        }
    }

    fn take(&mut self, len: usize) -> HornetResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| HornetError::Codec("payload truncated".to_owned()))?;
        let slice = &self.payload[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> HornetResult<u32> {
        let bytes = self.take(4)?;
        let array = <[u8; 4]>::try_from(bytes)
            .map_err(|_| HornetError::Codec("length prefix truncated".to_owned()))?;
        Ok(u32::from_le_bytes(array))
    }

    fn read_i64(&mut self) -> HornetResult<i64> {
        let bytes = self.take(8)?;
        let array = <[u8; 8]>::try_from(bytes)
            .map_err(|_| HornetError::Codec("integer payload truncated".to_owned()))?;
        Ok(i64::from_le_bytes(array))
    }

    fn read_value(&mut self) -> HornetResult<Value> {
        let tag = self.take(1)?[0];
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BIGINT => Ok(Value::BigInt(self.read_i64()?)),
            TAG_VARCHAR => {
                let len = self.read_u32()? as usize;
                let bytes = self.take(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| HornetError::Codec("varchar payload is not UTF-8".to_owned()))?;
                Ok(Value::Varchar(text.to_owned()))
            }
            TAG_VARBINARY => {
                let len = self.read_u32()? as usize;
                Ok(Value::Varbinary(self.take(len)?.to_vec()))
            }
            other => Err(HornetError::Codec(format!("unknown value tag {other}"))),
        }
    }

    fn finish(self) -> HornetResult<()> {
        if self.position == self.payload.len() {
            Ok(())
        } else {
            Err(HornetError::Codec("trailing bytes after payload".to_owned()))
        }
    }
}
