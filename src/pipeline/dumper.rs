//! Inventory Dumper
//!
//! Reads one dump unit from the source and pushes record batches into the
//! unit's channel. Ranged units are read page by page in unique key order;
//! units without a usable key are streamed in a single query.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::channel::ChannelSender;
use super::context::InventoryDumperContext;
use super::position::IngestPosition;
use super::record::{Column, ColumnValue, DataRecord, Operation, Record};
use super::source::{DumpFilter, DumpQuery, PipelineDataSource, Row};
use super::task::TaskOutcome;
use crate::error::{Error, Result};

/// Dumps one inventory unit
pub struct InventoryDumper {
    context: InventoryDumperContext,
    source: Arc<dyn PipelineDataSource>,
    channel: ChannelSender,
    cancel: CancellationToken,
}

/// Where a ranged dump continues from
enum Cursor {
    Integer { lower: i64, upper: i64 },
    String { lower: Option<String>, upper: Option<String> },
}

impl InventoryDumper {
    pub fn new(
        context: InventoryDumperContext,
        source: Arc<dyn PipelineDataSource>,
        channel: ChannelSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            source,
            channel,
            cancel,
        }
    }

    pub fn context(&self) -> &InventoryDumperContext {
        &self.context
    }

    /// Dump until the unit is exhausted or cancellation is observed
    pub async fn run(self) -> Result<TaskOutcome> {
        let task_id = self.context.task_id();
        tracing::debug!("Inventory dump {} starting at {}", task_id, self.context.position);

        let outcome = match self.context.position.clone() {
            IngestPosition::Finished => {
                self.push(vec![Record::Finished]).await?;
                TaskOutcome::Finished
            }
            IngestPosition::IntegerPrimaryKey {
                lower_bound,
                upper_bound,
            } => {
                self.dump_by_page(Cursor::Integer {
                    lower: lower_bound,
                    upper: upper_bound,
                })
                .await?
            }
            IngestPosition::StringPrimaryKey {
                lower_bound,
                upper_bound,
            } => {
                self.dump_by_page(Cursor::String {
                    lower: lower_bound,
                    upper: upper_bound,
                })
                .await?
            }
            IngestPosition::UnsupportedKey | IngestPosition::Placeholder => self.dump_all().await?,
            IngestPosition::Binlog { .. } => {
                return Err(Error::InvalidPosition(format!(
                    "{} has a change log position, not an inventory range",
                    task_id
                )))
            }
        };

        tracing::debug!("Inventory dump {} {}", task_id, outcome);
        Ok(outcome)
    }

    async fn dump_by_page(&self, mut cursor: Cursor) -> Result<TaskOutcome> {
        let unique_key = self
            .context
            .single_unique_key()
            .map(|c| c.name.clone())
            .ok_or_else(|| self.ingest_error("ranged unit without a single-column unique key"))?;
        let batch_size = self.context.batch_size.max(1);
        let mut first_page = true;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }

            let (lower, upper) = match &cursor {
                Cursor::Integer { lower, upper } => {
                    (Some(ColumnValue::Int(*lower)), Some(ColumnValue::Int(*upper)))
                }
                Cursor::String { lower, upper } => (
                    lower.clone().map(ColumnValue::String),
                    upper.clone().map(ColumnValue::String),
                ),
            };
            let query = DumpQuery {
                table: self.context.source_table(),
                columns: self.context.insert_columns.clone(),
                unique_key: Some(unique_key.clone()),
                filter: DumpFilter::Range {
                    lower,
                    lower_inclusive: first_page,
                    upper,
                    limit: batch_size,
                },
            };
            let rows = self
                .source
                .fetch(&query)
                .await
                .map_err(|e| self.ingest_error(e))?;
            first_page = false;

            if rows.is_empty() {
                self.push(vec![Record::Finished]).await?;
                return Ok(TaskOutcome::Finished);
            }
            let exhausted = rows.len() < batch_size;
            if !self.throttle(rows.len()).await {
                return Ok(TaskOutcome::Cancelled);
            }

            let mut records = Vec::with_capacity(rows.len() + 1);
            for row in rows {
                let key = row
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&unique_key))
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| self.ingest_error(format!("row without unique key {}", unique_key)))?;
                cursor = match cursor {
                    Cursor::Integer { upper, .. } => Cursor::Integer {
                        lower: key
                            .as_i64()
                            .ok_or_else(|| self.ingest_error(format!("non-integer key {}", key)))?,
                        upper,
                    },
                    Cursor::String { upper, .. } => Cursor::String {
                        lower: Some(key.to_string()),
                        upper,
                    },
                };
                let position = match &cursor {
                    Cursor::Integer { lower, upper } => IngestPosition::integer(*lower, *upper),
                    Cursor::String { lower, upper } => IngestPosition::StringPrimaryKey {
                        lower_bound: lower.clone(),
                        upper_bound: upper.clone(),
                    },
                };
                records.push(Record::Data(self.to_record(row, position)));
            }
            if exhausted {
                records.push(Record::Finished);
            }
            self.push(records).await?;

            if exhausted {
                return Ok(TaskOutcome::Finished);
            }
        }
    }

    async fn dump_all(&self) -> Result<TaskOutcome> {
        let query = DumpQuery {
            table: self.context.source_table(),
            columns: self.context.insert_columns.clone(),
            unique_key: None,
            filter: DumpFilter::All,
        };
        let batch_size = self.context.batch_size.max(1);
        let mut rows = self
            .source
            .stream(&query, batch_size)
            .await
            .map_err(|e| self.ingest_error(e))?;

        let mut batch = Vec::with_capacity(batch_size);
        loop {
            let row = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(TaskOutcome::Cancelled),
                row = rows.recv() => row,
            };
            match row {
                Some(row) => {
                    let row = row.map_err(|e| self.ingest_error(e))?;
                    batch.push(Record::Data(self.to_record(row, IngestPosition::UnsupportedKey)));
                    if batch.len() >= batch_size {
                        if !self.throttle(batch.len()).await {
                            return Ok(TaskOutcome::Cancelled);
                        }
                        self.push(std::mem::take(&mut batch)).await?;
                    }
                }
                None => break,
            }
        }
        if !self.throttle(batch.len()).await {
            return Ok(TaskOutcome::Cancelled);
        }
        batch.push(Record::Finished);
        self.push(batch).await?;
        Ok(TaskOutcome::Finished)
    }

    fn to_record(&self, row: Row, position: IngestPosition) -> DataRecord {
        let mut record = DataRecord::new(Operation::Insert, self.context.logical_table.clone(), position);
        for (name, value) in row {
            let unique_key = self.context.is_unique_key(&name);
            record.add_column(Column::new(name, value, unique_key));
        }
        record
    }

    /// Push a batch, giving up when cancelled while the channel is full.
    ///
    /// A cancelled importer drops its side of the channel, so a failed push
    /// after cancellation is reported as `Cancelled` too.
    async fn push(&self, records: Vec<Record>) -> Result<()> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.channel.push(records) => result,
        };
        match result {
            Err(_) if self.cancel.is_cancelled() => Err(Error::Cancelled),
            other => other,
        }
    }

    /// Apply the rate limit; false when cancelled while waiting
    async fn throttle(&self, rows: usize) -> bool {
        self.context
            .rate_limiter
            .intercept_until_cancelled(rows as u64, &self.cancel)
            .await
    }

    fn ingest_error(&self, reason: impl std::fmt::Display) -> Error {
        Error::Ingest {
            table: self.context.actual_table.clone(),
            reason: reason.to_string(),
        }
    }
}
