//! Binlog Events
//!
//! Decodes the row-based replication events the change capture needs:
//! format description, rotate, table map, row events and transaction
//! boundaries. Everything else is skipped by type code.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::pipeline::record::ColumnValue;

/// Binlog event type codes (MariaDB/MySQL)
#[allow(dead_code)]
pub mod event_type {
    pub const QUERY_EVENT: u8 = 2;
    pub const STOP_EVENT: u8 = 3;
    pub const ROTATE_EVENT: u8 = 4;
    pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
    pub const XID_EVENT: u8 = 16;
    pub const TABLE_MAP_EVENT: u8 = 19;
    pub const WRITE_ROWS_EVENT_V1: u8 = 23;
    pub const UPDATE_ROWS_EVENT_V1: u8 = 24;
    pub const DELETE_ROWS_EVENT_V1: u8 = 25;
    pub const HEARTBEAT_LOG_EVENT: u8 = 27;
    pub const WRITE_ROWS_EVENT: u8 = 30;
    pub const UPDATE_ROWS_EVENT: u8 = 31;
    pub const DELETE_ROWS_EVENT: u8 = 32;
}

/// Column type codes used in table map events
#[allow(dead_code)]
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// Common v4 event header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_length: u32,
    /// Offset of the next event in the current file; 0 for artificial events
    pub next_position: u32,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = Self {
            timestamp: cursor.read_u32::<LittleEndian>()?,
            event_type: cursor.read_u8()?,
            server_id: cursor.read_u32::<LittleEndian>()?,
            event_length: cursor.read_u32::<LittleEndian>()?,
            next_position: cursor.read_u32::<LittleEndian>()?,
        };
        let _flags = cursor.read_u16::<LittleEndian>()?;
        Ok(header)
    }
}

/// Table id to table mapping announced before row events
#[derive(Debug, Clone, PartialEq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<u8>,
    pub column_metadata: Vec<u16>,
}

/// Kind of a row event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// Values of one row image, by column index; None when the column is not
/// part of the image
pub type RowImage = Vec<Option<ColumnValue>>;

/// One changed row
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub table_id: u64,
    pub kind: RowsKind,
    pub rows: Vec<RowChange>,
}

/// Decoded event payload
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    FormatDescription { server_version: String, checksum: bool },
    Rotate { next_file: String, position: u64 },
    TableMap(TableMapEvent),
    Rows(RowsEvent),
    Xid { xid: u64 },
    Query { schema: String, query: String },
    Heartbeat,
    Other { type_code: u8 },
}

/// Stateful decoder: remembers the checksum setting and table maps
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    checksum: bool,
    tables: HashMap<u64, TableMapEvent>,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one event as sent in a binlog network packet (without the
    /// leading OK byte)
    pub fn decode(&mut self, data: &[u8]) -> Result<(EventHeader, BinlogEvent)> {
        if data.len() < EventHeader::SIZE {
            return Err(malformed(format!("event of {} bytes is shorter than its header", data.len())));
        }
        let header = EventHeader::parse(data)?;
        if header.event_length as usize != data.len() {
            return Err(malformed(format!(
                "type {} event from server {} at {} declares {} bytes, packet has {}",
                header.event_type,
                header.server_id,
                header.timestamp,
                header.event_length,
                data.len()
            )));
        }

        let body = if header.event_type == event_type::FORMAT_DESCRIPTION_EVENT {
            self.checksum = has_valid_checksum(data) && fde_checksum_alg(data) == Some(1);
            if self.checksum {
                &data[..data.len() - 4]
            } else {
                data
            }
        } else if self.checksum {
            if !has_valid_checksum(data) {
                return Err(malformed(format!(
                    "checksum mismatch on event type {} ending at {}",
                    header.event_type, header.next_position
                )));
            }
            &data[..data.len() - 4]
        } else {
            data
        };
        let payload = &body[EventHeader::SIZE..];

        let event = match header.event_type {
            event_type::FORMAT_DESCRIPTION_EVENT => decode_format_description(payload, self.checksum)?,
            event_type::ROTATE_EVENT => decode_rotate(payload)?,
            event_type::TABLE_MAP_EVENT => {
                let table_map = decode_table_map(payload)?;
                self.tables.insert(table_map.table_id, table_map.clone());
                BinlogEvent::TableMap(table_map)
            }
            event_type::WRITE_ROWS_EVENT_V1 | event_type::WRITE_ROWS_EVENT => {
                BinlogEvent::Rows(self.decode_rows(payload, RowsKind::Write, header.event_type)?)
            }
            event_type::UPDATE_ROWS_EVENT_V1 | event_type::UPDATE_ROWS_EVENT => {
                BinlogEvent::Rows(self.decode_rows(payload, RowsKind::Update, header.event_type)?)
            }
            event_type::DELETE_ROWS_EVENT_V1 | event_type::DELETE_ROWS_EVENT => {
                BinlogEvent::Rows(self.decode_rows(payload, RowsKind::Delete, header.event_type)?)
            }
            event_type::XID_EVENT => BinlogEvent::Xid {
                xid: Cursor::new(payload).read_u64::<LittleEndian>()?,
            },
            event_type::QUERY_EVENT => decode_query(payload)?,
            event_type::HEARTBEAT_LOG_EVENT => BinlogEvent::Heartbeat,
            other => BinlogEvent::Other { type_code: other },
        };
        Ok((header, event))
    }

    fn decode_rows(&self, payload: &[u8], kind: RowsKind, type_code: u8) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(payload);
        let table_id = read_table_id(&mut cursor)?;
        let _flags = cursor.read_u16::<LittleEndian>()?;
        if type_code >= event_type::WRITE_ROWS_EVENT {
            // Length includes its own two bytes
            let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
            skip(&mut cursor, extra_len.saturating_sub(2))?;
        }

        let table_map = self
            .tables
            .get(&table_id)
            .ok_or_else(|| malformed(format!("row event for unknown table id {}", table_id)))?;
        let column_count = read_packed_int(&mut cursor)? as usize;
        if column_count != table_map.column_types.len() {
            return Err(malformed(format!(
                "row event for {}.{} has {} columns, table map has {}",
                table_map.schema,
                table_map.table,
                column_count,
                table_map.column_types.len()
            )));
        }
        let present = read_bytes(&mut cursor, column_count.div_ceil(8))?;
        let present_after = match kind {
            RowsKind::Update => read_bytes(&mut cursor, column_count.div_ceil(8))?,
            _ => present.clone(),
        };

        let mut rows = Vec::new();
        while (cursor.position() as usize) < payload.len() {
            let row = match kind {
                RowsKind::Write => RowChange {
                    before: None,
                    after: Some(read_image(&mut cursor, table_map, &present)?),
                },
                RowsKind::Delete => RowChange {
                    before: Some(read_image(&mut cursor, table_map, &present)?),
                    after: None,
                },
                RowsKind::Update => RowChange {
                    before: Some(read_image(&mut cursor, table_map, &present)?),
                    after: Some(read_image(&mut cursor, table_map, &present_after)?),
                },
            };
            rows.push(row);
        }
        Ok(RowsEvent { table_id, kind, rows })
    }
}

fn malformed(reason: impl std::fmt::Display) -> Error {
    Error::Pipeline(format!("Malformed binlog event: {}", reason))
}

/// The trailing four bytes are the CRC32 of the rest of the event
fn has_valid_checksum(data: &[u8]) -> bool {
    if data.len() < EventHeader::SIZE + 4 {
        return false;
    }
    let (event, crc) = data.split_at(data.len() - 4);
    crc32fast::hash(event).to_le_bytes() == crc
}

/// Checksum algorithm byte of a format description event carrying a CRC
fn fde_checksum_alg(data: &[u8]) -> Option<u8> {
    data.len().checked_sub(5).and_then(|i| data.get(i)).copied()
}

fn decode_format_description(payload: &[u8], checksum: bool) -> Result<BinlogEvent> {
    let mut cursor = Cursor::new(payload);
    let _binlog_version = cursor.read_u16::<LittleEndian>()?;
    let version = read_bytes(&mut cursor, 50)?;
    let server_version = String::from_utf8_lossy(&version)
        .trim_end_matches('\0')
        .to_string();
    Ok(BinlogEvent::FormatDescription {
        server_version,
        checksum,
    })
}

fn decode_rotate(payload: &[u8]) -> Result<BinlogEvent> {
    let mut cursor = Cursor::new(payload);
    let position = cursor.read_u64::<LittleEndian>()?;
    let name = &payload[cursor.position() as usize..];
    Ok(BinlogEvent::Rotate {
        next_file: String::from_utf8_lossy(name).trim_end_matches('\0').to_string(),
        position,
    })
}

fn decode_query(payload: &[u8]) -> Result<BinlogEvent> {
    let mut cursor = Cursor::new(payload);
    let _thread_id = cursor.read_u32::<LittleEndian>()?;
    let _exec_time = cursor.read_u32::<LittleEndian>()?;
    let schema_len = cursor.read_u8()? as usize;
    let _error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = cursor.read_u16::<LittleEndian>()? as u64;
    skip(&mut cursor, status_len)?;
    let schema = read_bytes(&mut cursor, schema_len)?;
    let _nul = cursor.read_u8()?;
    let query = &payload[cursor.position() as usize..];
    Ok(BinlogEvent::Query {
        schema: String::from_utf8_lossy(&schema).to_string(),
        query: String::from_utf8_lossy(query).to_string(),
    })
}

fn decode_table_map(payload: &[u8]) -> Result<TableMapEvent> {
    let mut cursor = Cursor::new(payload);
    let table_id = read_table_id(&mut cursor)?;
    let _flags = cursor.read_u16::<LittleEndian>()?;
    let schema_len = cursor.read_u8()? as usize;
    let schema = read_bytes(&mut cursor, schema_len)?;
    let _nul = cursor.read_u8()?;
    let table_len = cursor.read_u8()? as usize;
    let table = read_bytes(&mut cursor, table_len)?;
    let _nul = cursor.read_u8()?;

    let column_count = read_packed_int(&mut cursor)? as usize;
    let column_types = read_bytes(&mut cursor, column_count)?;
    let metadata_len = read_packed_int(&mut cursor)? as usize;
    let metadata = read_bytes(&mut cursor, metadata_len)?;
    let column_metadata = decode_column_metadata(&column_types, &metadata)?;

    Ok(TableMapEvent {
        table_id,
        schema: String::from_utf8_lossy(&schema).to_string(),
        table: String::from_utf8_lossy(&table).to_string(),
        column_types,
        column_metadata,
    })
}

fn decode_column_metadata(column_types: &[u8], metadata: &[u8]) -> Result<Vec<u16>> {
    use column_type::*;

    let mut cursor = Cursor::new(metadata);
    let mut result = Vec::with_capacity(column_types.len());
    for column in column_types {
        let meta = match *column {
            FLOAT | DOUBLE | BLOB | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | JSON | GEOMETRY | TIME2
            | DATETIME2 | TIMESTAMP2 => cursor.read_u8()? as u16,
            VARCHAR | VAR_STRING | BIT => cursor.read_u16::<LittleEndian>()?,
            // Real type first, then length or pack length
            NEWDECIMAL | STRING | ENUM | SET => cursor.read_u16::<BigEndian>()?,
            _ => 0,
        };
        result.push(meta);
    }
    Ok(result)
}

fn read_image(cursor: &mut Cursor<&[u8]>, table_map: &TableMapEvent, present: &[u8]) -> Result<RowImage> {
    let present_count: usize = present.iter().map(|b| b.count_ones() as usize).sum();
    let nulls = read_bytes(cursor, present_count.div_ceil(8))?;

    let mut image = Vec::with_capacity(table_map.column_types.len());
    let mut null_index = 0;
    for (index, (column, meta)) in table_map
        .column_types
        .iter()
        .zip(&table_map.column_metadata)
        .enumerate()
    {
        if !bit_set(present, index) {
            image.push(None);
            continue;
        }
        let value = if bit_set(&nulls, null_index) {
            ColumnValue::Null
        } else {
            decode_value(cursor, *column, *meta)?
        };
        null_index += 1;
        image.push(Some(value));
    }
    Ok(image)
}

fn bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .map_or(false, |byte| byte & (1 << (index % 8)) != 0)
}

/// Decode one non-null column value.
///
/// Integers come out signed; [`to_unsigned`] reinterprets them for unsigned
/// columns, which the table map does not describe.
fn decode_value(cursor: &mut Cursor<&[u8]>, column: u8, meta: u16) -> Result<ColumnValue> {
    use column_type::*;

    let value = match column {
        TINY => ColumnValue::Int(cursor.read_i8()? as i64),
        SHORT => ColumnValue::Int(cursor.read_i16::<LittleEndian>()? as i64),
        INT24 => ColumnValue::Int(cursor.read_i24::<LittleEndian>()? as i64),
        LONG => ColumnValue::Int(cursor.read_i32::<LittleEndian>()? as i64),
        LONGLONG => ColumnValue::Int(cursor.read_i64::<LittleEndian>()?),
        FLOAT => ColumnValue::Float(cursor.read_f32::<LittleEndian>()? as f64),
        DOUBLE => ColumnValue::Float(cursor.read_f64::<LittleEndian>()?),
        YEAR => match cursor.read_u8()? {
            0 => ColumnValue::Int(0),
            year => ColumnValue::Int(1900 + year as i64),
        },
        NEWDECIMAL => ColumnValue::String(decode_decimal(cursor, (meta >> 8) as usize, (meta & 0xFF) as usize)?),
        DATE => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            ColumnValue::String(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0F,
                packed & 0x1F
            ))
        }
        TIME => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            ColumnValue::String(format!(
                "{:02}:{:02}:{:02}",
                packed / 10000,
                (packed / 100) % 100,
                packed % 100
            ))
        }
        TIME2 => decode_time2(cursor, meta as u8)?,
        DATETIME => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            let (date, time) = (packed / 1_000_000, packed % 1_000_000);
            datetime_value(
                (date / 10000) as i32,
                ((date / 100) % 100) as u32,
                (date % 100) as u32,
                (time / 10000) as u32,
                ((time / 100) % 100) as u32,
                (time % 100) as u32,
                0,
            )
        }
        DATETIME2 => {
            let packed = cursor.read_uint::<BigEndian>(5)?;
            let micros = read_fraction(cursor, meta as u8)?;
            let year_month = (packed >> 22) & 0x1FFFF;
            datetime_value(
                (year_month / 13) as i32,
                (year_month % 13) as u32,
                ((packed >> 17) & 0x1F) as u32,
                ((packed >> 12) & 0x1F) as u32,
                ((packed >> 6) & 0x3F) as u32,
                (packed & 0x3F) as u32,
                micros,
            )
        }
        TIMESTAMP => timestamp_value(cursor.read_u32::<LittleEndian>()?, 0),
        TIMESTAMP2 => {
            let seconds = cursor.read_u32::<BigEndian>()?;
            let micros = read_fraction(cursor, meta as u8)?;
            timestamp_value(seconds, micros)
        }
        VARCHAR | VAR_STRING => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            text_value(read_bytes(cursor, len)?)
        }
        STRING => {
            let (real_type, max_len) = string_meta(meta);
            match real_type {
                ENUM => ColumnValue::Int(read_uint_le(cursor, (max_len as usize).clamp(1, 2))? as i64),
                SET => ColumnValue::UInt(read_uint_le(cursor, (max_len as usize).clamp(1, 8))?),
                _ => {
                    let len = if max_len < 256 {
                        cursor.read_u8()? as usize
                    } else {
                        cursor.read_u16::<LittleEndian>()? as usize
                    };
                    text_value(read_bytes(cursor, len)?)
                }
            }
        }
        ENUM => ColumnValue::Int(read_uint_le(cursor, ((meta & 0xFF) as usize).clamp(1, 2))? as i64),
        SET => ColumnValue::UInt(read_uint_le(cursor, ((meta & 0xFF) as usize).clamp(1, 8))?),
        BIT => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xFF) as usize;
            ColumnValue::Bytes(read_bytes(cursor, bits.div_ceil(8))?)
        }
        BLOB | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | GEOMETRY => {
            let len = read_uint_le(cursor, (meta as usize).clamp(1, 4))? as usize;
            ColumnValue::Bytes(read_bytes(cursor, len)?)
        }
        JSON => {
            let len = read_uint_le(cursor, (meta as usize).clamp(1, 4))? as usize;
            let document = read_bytes(cursor, len)?;
            ColumnValue::String(super::json::decode(&document)?.to_string())
        }
        other => return Err(malformed(format!("unsupported column type {}", other))),
    };
    Ok(value)
}

/// Real type and maximum length packed into STRING metadata
fn string_meta(meta: u16) -> (u8, u16) {
    let (byte0, byte1) = ((meta >> 8) as u8, meta & 0xFF);
    if byte0 & 0x30 != 0x30 {
        // Lengths above 255 borrow two bits of the type byte
        (byte0 | 0x30, byte1 | ((((byte0 & 0x30) ^ 0x30) as u16) << 4))
    } else {
        (byte0, byte1)
    }
}

/// Reinterpret a signed integer decoded from `column` as unsigned
pub fn to_unsigned(column: u8, value: i64) -> u64 {
    match column {
        column_type::TINY => value as u8 as u64,
        column_type::SHORT => value as u16 as u64,
        column_type::INT24 => (value as u64) & 0xFF_FFFF,
        column_type::LONG => value as u32 as u64,
        _ => value as u64,
    }
}

fn text_value(bytes: Vec<u8>) -> ColumnValue {
    match String::from_utf8(bytes) {
        Ok(s) => ColumnValue::String(s),
        Err(e) => ColumnValue::Bytes(e.into_bytes()),
    }
}

fn datetime_value(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32, micros: u32) -> ColumnValue {
    chrono::NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros))
        .map(ColumnValue::Timestamp)
        // Zero dates have no calendar value
        .unwrap_or_else(|| {
            ColumnValue::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ))
        })
}

fn timestamp_value(seconds: u32, micros: u32) -> ColumnValue {
    if seconds == 0 {
        return ColumnValue::String("0000-00-00 00:00:00".to_string());
    }
    match chrono::DateTime::from_timestamp(seconds as i64, micros * 1000) {
        Some(ts) => ColumnValue::Timestamp(ts.naive_utc()),
        None => ColumnValue::Int(seconds as i64),
    }
}

fn decode_time2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<ColumnValue> {
    let packed = cursor.read_u24::<BigEndian>()? as i64 - 0x80_0000;
    let micros = read_fraction(cursor, fsp)?;
    let negative = packed < 0;
    let value = packed.unsigned_abs();
    let (hours, minutes, seconds) = ((value >> 12) & 0x3FF, (value >> 6) & 0x3F, value & 0x3F);
    let sign = if negative { "-" } else { "" };
    Ok(ColumnValue::String(if micros > 0 {
        format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, minutes, seconds, micros)
    } else {
        format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds)
    }))
}

/// Fractional seconds of TIME2/DATETIME2/TIMESTAMP2, as microseconds
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let bytes = (fsp as usize).div_ceil(2).min(3);
    if bytes == 0 {
        return Ok(0);
    }
    let value = cursor.read_uint::<BigEndian>(bytes)? as u32;
    Ok(value * 10u32.pow(6 - 2 * bytes as u32))
}

/// Packed DECIMAL to its text form
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

    let integral = precision
        .checked_sub(scale)
        .ok_or_else(|| malformed(format!("decimal scale {} above precision {}", scale, precision)))?;
    let (int_words, int_rest) = (integral / 9, integral % 9);
    let (frac_words, frac_rest) = (scale / 9, scale % 9);
    let size = DIG_TO_BYTES[int_rest] + int_words * 4 + frac_words * 4 + DIG_TO_BYTES[frac_rest];

    let mut bytes = read_bytes(cursor, size)?;
    let Some(first) = bytes.first_mut() else {
        return Ok("0".to_string());
    };
    let negative = *first & 0x80 == 0;
    *first ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    // Leading zero groups are dropped, later groups keep their width
    fn push_group(integer: &mut String, value: u64, width: usize) {
        if integer.is_empty() {
            if value != 0 {
                integer.push_str(&value.to_string());
            }
        } else {
            integer.push_str(&format!("{:0width$}", value, width = width));
        }
    }

    let mut digits = Cursor::new(bytes.as_slice());
    let mut integer = String::new();
    if int_rest > 0 {
        let value = digits.read_uint::<BigEndian>(DIG_TO_BYTES[int_rest])?;
        push_group(&mut integer, value, int_rest);
    }
    for _ in 0..int_words {
        let value = digits.read_u32::<BigEndian>()? as u64;
        push_group(&mut integer, value, 9);
    }
    if integer.is_empty() {
        integer.push('0');
    }

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    text.push_str(&integer);
    if scale > 0 {
        text.push('.');
        for _ in 0..frac_words {
            text.push_str(&format!("{:09}", digits.read_u32::<BigEndian>()?));
        }
        if frac_rest > 0 {
            let value = digits.read_uint::<BigEndian>(DIG_TO_BYTES[frac_rest])?;
            text.push_str(&format!("{:0width$}", value, width = frac_rest));
        }
    }
    Ok(text)
}

fn read_table_id(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    Ok(cursor.read_uint::<LittleEndian>(6)?)
}

/// Length-encoded integer
fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    match cursor.read_u8()? {
        first @ 0..=250 => Ok(first as u64),
        252 => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        253 => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        254 => Ok(cursor.read_u64::<LittleEndian>()?),
        other => Err(malformed(format!("invalid length-encoded integer prefix {}", other))),
    }
}

fn read_uint_le(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<u64> {
    Ok(cursor.read_uint::<LittleEndian>(bytes)?)
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(malformed(format!("needs {} bytes, {} left", len, remaining)));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn skip(cursor: &mut Cursor<&[u8]>, len: u64) -> Result<()> {
    let target = cursor.position() + len;
    if target > cursor.get_ref().len() as u64 {
        return Err(malformed("field runs past the end of the event"));
    }
    cursor.set_position(target);
    Ok(())
}
