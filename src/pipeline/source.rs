//! Source and Sink Interfaces
//!
//! What the pipeline needs from the source database and the target store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::position::IngestPosition;
use super::record::{ColumnValue, DataRecord};
use super::sql::{Dialect, TableName};
use crate::error::{Error, Result};

/// Value class of a unique key column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Integer,
    String,
    Other,
}

impl KeyKind {
    /// Classify a SQL column type name
    pub fn from_sql_type(data_type: &str) -> Self {
        let base = data_type
            .trim()
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let unsigned = data_type.to_ascii_lowercase().contains("unsigned");
        match base.as_str() {
            // Upper half of the unsigned range does not fit an i64 position
            "bigint" if unsigned => KeyKind::Other,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2" | "int4"
            | "int8" | "serial" | "bigserial" => KeyKind::Integer,
            "char" | "varchar" | "character" | "text" | "tinytext" | "mediumtext" | "longtext" => {
                KeyKind::String
            }
            _ => KeyKind::Other,
        }
    }
}

/// A table column, as listed for unique keys and change capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetaData {
    pub name: String,
    pub data_type: String,
    pub kind: KeyKind,
}

impl ColumnMetaData {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            kind: KeyKind::from_sql_type(&data_type),
            data_type,
        }
    }
}

/// Row selection for one dump query
#[derive(Debug, Clone, PartialEq)]
pub enum DumpFilter {
    /// Ordered page of a unique key range
    Range {
        lower: Option<ColumnValue>,
        lower_inclusive: bool,
        upper: Option<ColumnValue>,
        limit: usize,
    },
    /// Rows whose unique key equals the value
    Point(ColumnValue),
    /// Every row
    All,
}

/// One dump query against a source table
#[derive(Debug, Clone, PartialEq)]
pub struct DumpQuery {
    pub table: TableName,
    /// Columns to select; None selects all
    pub columns: Option<Vec<String>>,
    pub unique_key: Option<String>,
    pub filter: DumpFilter,
}

/// A fetched row: column name and value pairs in select order
pub type Row = Vec<(String, ColumnValue)>;

/// Source database used by splitting and dumping
#[async_trait]
pub trait PipelineDataSource: Send + Sync {
    /// Configured data source name
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Catalog row estimate; None when the dialect has none
    async fn estimated_count(&self, table: &TableName) -> Result<Option<i64>>;

    /// Exact row count
    async fn exact_count(&self, table: &TableName) -> Result<i64>;

    /// `MIN` and `MAX` of an integer unique key; None for an empty table
    async fn unique_key_range(&self, table: &TableName, unique_key: &str) -> Result<Option<(i64, i64)>>;

    /// Unique key columns: the primary key, or else the first unique index
    async fn unique_key_columns(&self, table: &TableName) -> Result<Vec<ColumnMetaData>>;

    /// Every column of a table in ordinal order
    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnMetaData>> {
        Err(Error::Pipeline(format!("{} cannot list the columns of {}", self.name(), table)))
    }

    /// Run a dump query
    async fn fetch(&self, query: &DumpQuery) -> Result<Vec<Row>>;

    /// Run a dump query, yielding rows as they are read
    async fn stream(&self, query: &DumpQuery, _buffer: usize) -> Result<mpsc::Receiver<Result<Row>>> {
        let rows = self.fetch(query).await?;
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            // Capacity covers every row
            let _ = tx.try_send(Ok(row));
        }
        Ok(rx)
    }

    /// Current change-log coordinates, when the source has a change log
    async fn current_log_position(&self) -> Result<Option<IngestPosition>> {
        Ok(None)
    }
}

/// Target store written by importers
#[async_trait]
pub trait PipelineSink: Send + Sync {
    /// Apply records in order; returns the number of records written
    async fn write(&self, records: &[DataRecord]) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_kind_from_sql_type() {
        assert_eq!(KeyKind::from_sql_type("bigint(20) unsigned"), KeyKind::Other);
        assert_eq!(KeyKind::from_sql_type("BIGINT UNSIGNED"), KeyKind::Other);
        assert_eq!(KeyKind::from_sql_type("int(10) unsigned"), KeyKind::Integer);
        assert_eq!(KeyKind::from_sql_type("INT"), KeyKind::Integer);
        assert_eq!(KeyKind::from_sql_type("varchar(64)"), KeyKind::String);
        assert_eq!(KeyKind::from_sql_type("decimal(10,2)"), KeyKind::Other);
        assert_eq!(KeyKind::from_sql_type("datetime"), KeyKind::Other);
    }
}
