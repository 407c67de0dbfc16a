//! In-memory data source and sink for pipeline tests

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::position::IngestPosition;
use super::record::{ColumnValue, DataRecord};
use super::source::{ColumnMetaData, DumpFilter, DumpQuery, PipelineDataSource, PipelineSink, Row};
use super::sql::{Dialect, TableName};
use crate::error::{Error, Result};

#[derive(Default)]
struct MemoryTable {
    unique_key: Vec<ColumnMetaData>,
    columns: Vec<ColumnMetaData>,
    rows: Vec<Row>,
    estimated_count: Option<i64>,
    key_range: Option<(i64, i64)>,
}

pub struct MemoryDataSource {
    name: String,
    tables: HashMap<String, MemoryTable>,
    fail_counts: bool,
    fetch_delay: Option<Duration>,
    log_position: Option<IngestPosition>,
    fetches: AtomicUsize,
}

impl MemoryDataSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: HashMap::new(),
            fail_counts: false,
            fetch_delay: None,
            log_position: None,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Table keyed by an integer column holding every key in `keys`
    pub fn with_sequential_table(mut self, table: &str, key: &str, keys: RangeInclusive<i64>) -> Self {
        let rows = keys
            .map(|k| {
                vec![
                    (key.to_string(), ColumnValue::Int(k)),
                    ("status".to_string(), ColumnValue::String(format!("s{}", k))),
                ]
            })
            .collect();
        self.tables.insert(
            table.to_string(),
            MemoryTable {
                unique_key: vec![ColumnMetaData::new(key, "bigint")],
                rows,
                ..Default::default()
            },
        );
        self
    }

    /// Table with explicit key columns and rows
    pub fn with_table(mut self, table: &str, unique_key: Vec<ColumnMetaData>, rows: Vec<Row>) -> Self {
        self.tables.insert(
            table.to_string(),
            MemoryTable {
                unique_key,
                rows,
                ..Default::default()
            },
        );
        self
    }

    /// Table with explicit key columns and no rows
    pub fn with_empty_table(mut self, table: &str, unique_key: Vec<ColumnMetaData>) -> Self {
        self.tables.insert(
            table.to_string(),
            MemoryTable {
                unique_key,
                ..Default::default()
            },
        );
        self
    }

    /// Pretend a table has `rows` rows over keys `[minimum, maximum]` without
    /// materializing them
    pub fn with_virtual_table(mut self, table: &str, key: ColumnMetaData, rows: i64, minimum: i64, maximum: i64) -> Self {
        self.tables.insert(
            table.to_string(),
            MemoryTable {
                unique_key: vec![key],
                estimated_count: Some(rows),
                key_range: Some((minimum, maximum)),
                ..Default::default()
            },
        );
        self
    }

    /// Full column list of a registered table
    pub fn with_columns(mut self, table: &str, columns: Vec<ColumnMetaData>) -> Self {
        if let Some(t) = self.tables.get_mut(table) {
            t.columns = columns;
        }
        self
    }

    pub fn with_estimated_count(mut self, table: &str, count: Option<i64>) -> Self {
        if let Some(t) = self.tables.get_mut(table) {
            t.estimated_count = count;
        }
        self
    }

    pub fn with_failing_counts(mut self) -> Self {
        self.fail_counts = true;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn with_log_position(mut self, position: IngestPosition) -> Self {
        self.log_position = Some(position);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn table(&self, table: &TableName) -> Result<&MemoryTable> {
        self.tables
            .get(&table.table)
            .ok_or_else(|| Error::QueryExecution(format!("Table '{}' doesn't exist", table)))
    }
}

fn key_of<'a>(row: &'a Row, key: &str) -> Option<&'a ColumnValue> {
    row.iter().find(|(name, _)| name == key).map(|(_, v)| v)
}

fn compare(left: &ColumnValue, right: &ColumnValue) -> std::cmp::Ordering {
    match (left.as_i64(), right.as_i64()) {
        (Some(l), Some(r)) => l.cmp(&r),
        _ => left.to_string().cmp(&right.to_string()),
    }
}

#[async_trait]
impl PipelineDataSource for MemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn estimated_count(&self, table: &TableName) -> Result<Option<i64>> {
        if self.fail_counts {
            return Err(Error::QueryExecution("statistics unavailable".into()));
        }
        Ok(self.table(table)?.estimated_count)
    }

    async fn exact_count(&self, table: &TableName) -> Result<i64> {
        if self.fail_counts {
            return Err(Error::QueryExecution("count failed".into()));
        }
        Ok(self.table(table)?.rows.len() as i64)
    }

    async fn unique_key_range(&self, table: &TableName, unique_key: &str) -> Result<Option<(i64, i64)>> {
        let t = self.table(table)?;
        if let Some(range) = t.key_range {
            return Ok(Some(range));
        }
        let keys: Vec<i64> = t
            .rows
            .iter()
            .filter_map(|row| key_of(row, unique_key).and_then(ColumnValue::as_i64))
            .collect();
        Ok(keys.iter().min().copied().zip(keys.iter().max().copied()))
    }

    async fn unique_key_columns(&self, table: &TableName) -> Result<Vec<ColumnMetaData>> {
        Ok(self.table(table)?.unique_key.clone())
    }

    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnMetaData>> {
        Ok(self.table(table)?.columns.clone())
    }

    async fn fetch(&self, query: &DumpQuery) -> Result<Vec<Row>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let t = self.table(&query.table)?;
        let key = query.unique_key.clone().unwrap_or_default();

        let mut rows: Vec<Row> = match &query.filter {
            DumpFilter::All => t.rows.clone(),
            DumpFilter::Point(value) => t
                .rows
                .iter()
                .filter(|row| key_of(row, &key) == Some(value))
                .cloned()
                .collect(),
            DumpFilter::Range {
                lower,
                lower_inclusive,
                upper,
                limit,
            } => {
                let mut selected: Vec<Row> = t
                    .rows
                    .iter()
                    .filter(|row| {
                        let Some(k) = key_of(row, &key) else { return false };
                        let above = match lower {
                            Some(l) if *lower_inclusive => compare(k, l).is_ge(),
                            Some(l) => compare(k, l).is_gt(),
                            None => true,
                        };
                        let below = upper.as_ref().map_or(true, |u| compare(k, u).is_le());
                        above && below
                    })
                    .cloned()
                    .collect();
                selected.sort_by(|a, b| compare(key_of(a, &key).unwrap_or(&ColumnValue::Null), key_of(b, &key).unwrap_or(&ColumnValue::Null)));
                selected.truncate(*limit);
                selected
            }
        };
        if let Some(columns) = &query.columns {
            for row in rows.iter_mut() {
                row.retain(|(name, _)| columns.iter().any(|c| c == name));
            }
        }
        Ok(rows)
    }

    async fn current_log_position(&self) -> Result<Option<IngestPosition>> {
        Ok(self.log_position.clone())
    }
}

/// Sink collecting written records
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<DataRecord>>,
    fail: bool,
    write_delay: Option<Duration>,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn records(&self) -> Vec<DataRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineSink for MemorySink {
    async fn write(&self, records: &[DataRecord]) -> Result<u64> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(Error::QueryExecution("target unavailable".into()));
        }
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(records.len() as u64)
    }
}
