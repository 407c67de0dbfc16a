//! MySQL binary JSON values as they appear in row events

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0A;
const DOUBLE: u8 = 0x0B;
const STRING: u8 = 0x0C;
const OPAQUE: u8 = 0x0F;

/// Decode a binary JSON document; an empty document is JSON null
pub fn decode(data: &[u8]) -> Result<Value> {
    match data.split_first() {
        None => Ok(Value::Null),
        Some((&value_type, body)) => decode_value(value_type, body),
    }
}

fn invalid(reason: impl std::fmt::Display) -> Error {
    Error::Pipeline(format!("Malformed binary JSON: {}", reason))
}

fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| invalid(format!("{} bytes at {} past the end of {}", len, offset, data.len())))
}

fn read_uint(data: &[u8], offset: usize, len: usize) -> Result<u64> {
    let bytes = slice(data, offset, len)?;
    Ok(bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn decode_value(value_type: u8, data: &[u8]) -> Result<Value> {
    let value = match value_type {
        SMALL_OBJECT => decode_container(data, false, true)?,
        LARGE_OBJECT => decode_container(data, true, true)?,
        SMALL_ARRAY => decode_container(data, false, false)?,
        LARGE_ARRAY => decode_container(data, true, false)?,
        LITERAL => decode_literal(read_uint(data, 0, 1)?)?,
        INT16 => Value::from(read_uint(data, 0, 2)? as u16 as i16),
        UINT16 => Value::from(read_uint(data, 0, 2)? as u16),
        INT32 => Value::from(read_uint(data, 0, 4)? as u32 as i32),
        UINT32 => Value::from(read_uint(data, 0, 4)? as u32),
        INT64 => Value::from(read_uint(data, 0, 8)? as i64),
        UINT64 => Value::from(read_uint(data, 0, 8)?),
        DOUBLE => {
            let bits = read_uint(data, 0, 8)?;
            Number::from_f64(f64::from_bits(bits))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        STRING => {
            let (len, used) = read_varlen(data)?;
            let bytes = slice(data, used, len)?;
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        OPAQUE => {
            // Column type byte, then a length-prefixed payload
            let (len, used) = read_varlen(slice(data, 1, data.len().saturating_sub(1))?)?;
            let bytes = slice(data, 1 + used, len)?;
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        other => return Err(invalid(format!("unknown value type {:#04x}", other))),
    };
    Ok(value)
}

fn decode_literal(literal: u64) -> Result<Value> {
    match literal {
        0 => Ok(Value::Null),
        1 => Ok(Value::Bool(true)),
        2 => Ok(Value::Bool(false)),
        other => Err(invalid(format!("unknown literal {}", other))),
    }
}

/// Objects and arrays share one layout: counts, key entries (objects only),
/// value entries, then the out-of-line data. Offsets are relative to `data`.
fn decode_container(data: &[u8], large: bool, object: bool) -> Result<Value> {
    let width = if large { 4 } else { 2 };
    let count = read_uint(data, 0, width)? as usize;
    let _size = read_uint(data, width, width)?;
    let header = 2 * width;
    let value_entry = 1 + width;
    let key_entry = width + 2;
    let values_start = if object { header + count * key_entry } else { header };

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let entry = values_start + i * value_entry;
        let value_type = read_uint(data, entry, 1)? as u8;
        let inline = matches!(value_type, LITERAL | INT16 | UINT16)
            || (large && matches!(value_type, INT32 | UINT32));
        let value = if inline {
            decode_value(value_type, slice(data, entry + 1, width)?)?
        } else {
            let offset = read_uint(data, entry + 1, width)? as usize;
            decode_value(value_type, slice(data, offset, data.len().saturating_sub(offset))?)?
        };
        values.push(value);
    }

    if !object {
        return Ok(Value::Array(values));
    }
    let mut map = Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let entry = header + i * key_entry;
        let offset = read_uint(data, entry, width)? as usize;
        let len = read_uint(data, entry + width, 2)? as usize;
        let key = String::from_utf8_lossy(slice(data, offset, len)?).into_owned();
        map.insert(key, value);
    }
    Ok(Value::Object(map))
}

/// Seven bits per byte, high bit set while more bytes follow
fn read_varlen(data: &[u8]) -> Result<(usize, usize)> {
    let mut len = 0usize;
    for (i, byte) in data.iter().take(5).enumerate() {
        len |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((len, i + 1));
        }
    }
    Err(invalid("unterminated length"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(decode(&[]).unwrap(), Value::Null);
        assert_eq!(decode(&[LITERAL, 1]).unwrap(), json!(true));
        assert_eq!(decode(&[INT16, 0xFE, 0xFF]).unwrap(), json!(-2));
        assert_eq!(decode(&[STRING, 3, b'a', b'b', b'c']).unwrap(), json!("abc"));
        let mut double = vec![DOUBLE];
        double.extend_from_slice(&1.5f64.to_bits().to_le_bytes());
        assert_eq!(decode(&double).unwrap(), json!(1.5));
    }

    #[test]
    fn test_small_object() {
        // {"id": 7, "tag": "vip"}
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        // key entries: header 4 + 2*4 keys + 2*3 values = 18
        body.extend_from_slice(&18u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&20u16.to_le_bytes());
        body.extend_from_slice(&3u16.to_le_bytes());
        body.push(UINT16);
        body.extend_from_slice(&7u16.to_le_bytes());
        body.push(STRING);
        body.extend_from_slice(&23u16.to_le_bytes());
        body.extend_from_slice(b"idtag");
        body.extend_from_slice(&[3, b'v', b'i', b'p']);
        let size = body.len() as u16;
        body[2..4].copy_from_slice(&size.to_le_bytes());

        let mut document = vec![SMALL_OBJECT];
        document.extend_from_slice(&body);
        assert_eq!(decode(&document).unwrap(), json!({"id": 7, "tag": "vip"}));
    }

    #[test]
    fn test_small_array_with_literal() {
        let mut document = vec![SMALL_ARRAY];
        document.extend_from_slice(&2u16.to_le_bytes());
        document.extend_from_slice(&10u16.to_le_bytes());
        document.push(LITERAL);
        document.extend_from_slice(&0u16.to_le_bytes());
        document.push(INT16);
        document.extend_from_slice(&5u16.to_le_bytes());
        assert_eq!(decode(&document).unwrap(), json!([null, 5]));
    }

    #[test]
    fn test_out_of_range_offset_is_an_error() {
        let mut document = vec![SMALL_ARRAY];
        document.extend_from_slice(&1u16.to_le_bytes());
        document.extend_from_slice(&7u16.to_le_bytes());
        document.push(STRING);
        document.extend_from_slice(&500u16.to_le_bytes());
        assert!(decode(&document).is_err());
    }
}
