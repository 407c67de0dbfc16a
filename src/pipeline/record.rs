//! Pipeline Records
//!
//! Rows travelling from a dumper to an importer.

use serde::{Deserialize, Serialize};

use super::position::IngestPosition;

/// Column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(chrono::NaiveDateTime),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Integer view of the value, used for unique key ranges
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(i) => Some(*i),
            ColumnValue::UInt(u) => i64::try_from(*u).ok(),
            ColumnValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Bool(b) => write!(f, "{}", b),
            ColumnValue::Int(i) => write!(f, "{}", i),
            ColumnValue::UInt(u) => write!(f, "{}", u),
            ColumnValue::Float(v) => write!(f, "{}", v),
            ColumnValue::String(s) => write!(f, "{}", s),
            ColumnValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ColumnValue::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.6f")),
        }
    }
}

/// A named column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
    /// Part of the row's unique key
    pub unique_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: ColumnValue, unique_key: bool) -> Self {
        Self {
            name: name.into(),
            value,
            unique_key,
        }
    }
}

/// Row operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub operation: Operation,
    /// Target (logical) table
    pub table: String,
    /// Position to acknowledge once this record is written
    pub position: IngestPosition,
    pub columns: Vec<Column>,
}

impl DataRecord {
    pub fn new(operation: Operation, table: impl Into<String>, position: IngestPosition) -> Self {
        Self {
            operation,
            table: table.into(),
            position,
            columns: Vec::new(),
        }
    }

    pub fn add_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    pub fn unique_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.unique_key)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// An item in the dumper → importer channel
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Data(DataRecord),
    /// End of the dump unit
    Finished,
}

impl Record {
    /// Position reached once this record is written
    pub fn position(&self) -> IngestPosition {
        match self {
            Record::Data(record) => record.position.clone(),
            Record::Finished => IngestPosition::Finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_key_columns() {
        let mut record = DataRecord::new(Operation::Insert, "t_order", IngestPosition::integer(1, 10));
        record.add_column(Column::new("order_id", ColumnValue::Int(1), true));
        record.add_column(Column::new("user_id", ColumnValue::Int(7), false));

        let keys: Vec<&str> = record.unique_key_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(keys, vec!["order_id"]);
        assert_eq!(record.column("USER_ID").unwrap().value, ColumnValue::Int(7));
    }

    #[test]
    fn test_record_position() {
        assert_eq!(Record::Finished.position(), IngestPosition::Finished);
        let record = DataRecord::new(Operation::Delete, "t", IngestPosition::integer(3, 9));
        assert_eq!(Record::Data(record).position(), IngestPosition::integer(3, 9));
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(ColumnValue::UInt(5).as_i64(), Some(5));
        assert_eq!(ColumnValue::UInt(u64::MAX).as_i64(), None);
        assert_eq!(ColumnValue::String("42".into()).as_i64(), Some(42));
        assert_eq!(ColumnValue::Null.as_i64(), None);
    }
}
