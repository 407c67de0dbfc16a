//! Inventory Task Splitter
//!
//! Turns a job item's table map into dump units. Each table is split by its
//! unique key: integer keys into contiguous ranges sized by the configured
//! shard size, anything else into a single unit. Resumed job items reuse the
//! persisted positions so shard boundaries never move between runs.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::context::InventoryDumperContext;
use super::job::JobItemContext;
use super::position::{split_integer_range, IngestPosition};
use super::source::{KeyKind, PipelineDataSource, PipelineSink};
use super::sql::TableName;
use super::task::{InventoryTask, TaskSettings};
use crate::error::{Error, Result};

/// Splits job items into inventory dump units
#[derive(Debug, Clone, Copy)]
pub struct InventoryTaskSplitter {
    shard_size: u64,
}

impl InventoryTaskSplitter {
    pub fn new(shard_size: u64) -> Self {
        Self {
            shard_size: shard_size.max(1),
        }
    }

    /// Build one inventory task per dump unit of the job item
    pub async fn split_inventory_tasks(
        &self,
        job_item: &JobItemContext,
        sink: Arc<dyn PipelineSink>,
        settings: TaskSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<InventoryTask>> {
        let contexts = self.split_inventory_dumper_contexts(job_item).await?;
        Ok(contexts
            .into_iter()
            .map(|context| {
                InventoryTask::new(
                    context,
                    job_item.source.clone(),
                    sink.clone(),
                    settings,
                    job_item.processed_records.clone(),
                    cancel.clone(),
                )
            })
            .collect())
    }

    /// Dump units for every table of the job item, in table map order
    pub async fn split_inventory_dumper_contexts(
        &self,
        job_item: &JobItemContext,
    ) -> Result<Vec<InventoryDumperContext>> {
        let mut result = Vec::new();
        for context in self.split_by_table(job_item) {
            result.extend(self.split_by_unique_key(job_item, context).await?);
        }
        Ok(result)
    }

    fn split_by_table(&self, job_item: &JobItemContext) -> Vec<InventoryDumperContext> {
        job_item
            .tables
            .iter()
            .map(|table| {
                let mut context = InventoryDumperContext::new(
                    job_item.source.name(),
                    table.actual.clone(),
                    table.logical.clone(),
                    job_item.schema_mapper.clone(),
                );
                context.batch_size = job_item.batch_size;
                context.rate_limiter = job_item.rate_limiter.clone();
                context
            })
            .collect()
    }

    async fn split_by_unique_key(
        &self,
        job_item: &JobItemContext,
        mut context: InventoryDumperContext,
    ) -> Result<Vec<InventoryDumperContext>> {
        if context.unique_key_columns.is_none() {
            let columns = job_item
                .source
                .unique_key_columns(&context.source_table())
                .await
                .map_err(|e| Error::split_by_unique_key(&context.actual_table, None, e))?;
            context.unique_key_columns = Some(columns);
        }

        let positions = self.inventory_positions(job_item, &context).await?;
        tracing::info!(
            "Split {} into {} inventory unit(s)",
            context.source_table(),
            positions.len()
        );
        Ok(positions
            .into_iter()
            .map(|(sharding_item, position)| context.fork(position, sharding_item))
            .collect())
    }

    /// Positions of a table's units, paired with their sharding items
    async fn inventory_positions(
        &self,
        job_item: &JobItemContext,
        context: &InventoryDumperContext,
    ) -> Result<Vec<(usize, IngestPosition)>> {
        if let Some(progress) = &job_item.init_progress {
            let prior = progress.table_positions(&context.data_source_name, &context.actual_table);
            if !prior.is_empty() {
                tracing::debug!(
                    "Reusing {} persisted position(s) for {}",
                    prior.len(),
                    context.actual_table
                );
                return Ok(prior);
            }
        }

        let source = job_item.source.as_ref();
        let table = context.source_table();
        let unique_key = context.unique_key_name();
        let estimated_rows = estimate_row_count(source, &table, unique_key).await?;
        job_item.add_estimated_records(estimated_rows);

        let positions = match context.single_unique_key() {
            None => vec![IngestPosition::UnsupportedKey],
            Some(key) => self.positions_by_key(source, &table, &key.name, key.kind, estimated_rows).await?,
        };
        Ok(positions.into_iter().enumerate().collect())
    }

    async fn positions_by_key(
        &self,
        source: &dyn PipelineDataSource,
        table: &TableName,
        unique_key: &str,
        kind: KeyKind,
        estimated_rows: u64,
    ) -> Result<Vec<IngestPosition>> {
        match kind {
            KeyKind::Integer => self.integer_positions(source, table, unique_key, estimated_rows).await,
            // Collation-dependent ordering; string keys stay one unit
            KeyKind::String => Ok(vec![IngestPosition::StringPrimaryKey {
                lower_bound: None,
                upper_bound: None,
            }]),
            KeyKind::Other => Ok(vec![IngestPosition::UnsupportedKey]),
        }
    }

    async fn integer_positions(
        &self,
        source: &dyn PipelineDataSource,
        table: &TableName,
        unique_key: &str,
        estimated_rows: u64,
    ) -> Result<Vec<IngestPosition>> {
        if estimated_rows == 0 {
            return Ok(vec![IngestPosition::integer(0, 0)]);
        }
        let range = source
            .unique_key_range(table, unique_key)
            .await
            .map_err(|e| Error::split_by_unique_key(&table.table, Some(unique_key), e))?;
        if let Some((minimum, maximum)) = range {
            return Ok(split_integer_range(minimum, maximum, estimated_rows, self.shard_size));
        }

        // No bounds: either the estimate was stale and the table is empty,
        // or the keys do not fit the integer range
        let rows = source
            .exact_count(table)
            .await
            .map_err(|e| Error::split_by_unique_key(&table.table, Some(unique_key), e))?;
        if rows == 0 {
            return Ok(vec![IngestPosition::integer(0, 0)]);
        }
        Err(Error::split_by_unique_key(
            &table.table,
            Some(unique_key),
            format!("{} rows but no integer key range", rows),
        ))
    }
}

/// Row count of a table: the catalog estimate when the dialect has a
/// positive one, otherwise an exact count
pub async fn estimate_row_count(
    source: &dyn PipelineDataSource,
    table: &TableName,
    unique_key: Option<&str>,
) -> Result<u64> {
    let started = Instant::now();
    let estimated = source
        .estimated_count(table)
        .await
        .map_err(|e| Error::split_by_unique_key(&table.table, unique_key, e))?;
    if let Some(rows) = estimated.filter(|rows| *rows > 0) {
        tracing::info!(
            "Estimated {} rows in {} in {:?}",
            rows,
            table,
            started.elapsed()
        );
        return Ok(rows as u64);
    }

    let started = Instant::now();
    let rows = source
        .exact_count(table)
        .await
        .map_err(|e| Error::split_by_unique_key(&table.table, unique_key, e))?;
    tracing::info!("Counted {} rows in {} in {:?}", rows, table, started.elapsed());
    Ok(rows.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableMappingConfig;
    use crate::pipeline::job::JobItemProgress;
    use crate::pipeline::record::ColumnValue;
    use crate::pipeline::source::ColumnMetaData;
    use crate::pipeline::testing::MemoryDataSource;

    fn job_item(source: MemoryDataSource, tables: &[(&str, &str)]) -> JobItemContext {
        let tables = tables
            .iter()
            .map(|(actual, logical)| TableMappingConfig {
                actual: actual.to_string(),
                logical: logical.to_string(),
                schema: None,
            })
            .collect();
        JobItemContext::new("j1", 0, tables, Arc::new(source))
    }

    fn bounds(contexts: &[InventoryDumperContext]) -> Vec<(i64, i64)> {
        contexts.iter().filter_map(|c| c.position.integer_bounds()).collect()
    }

    #[tokio::test]
    async fn test_ten_million_rows_split_into_ten_units() {
        let source = MemoryDataSource::new("ds_0").with_virtual_table(
            "t_order_0",
            ColumnMetaData::new("order_id", "bigint"),
            10_000_000,
            1,
            10_000_000,
        );
        let item = job_item(source, &[("t_order_0", "t_order")]);
        let contexts = InventoryTaskSplitter::new(1_000_000)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap();

        assert_eq!(contexts.len(), 10);
        let items: Vec<usize> = contexts.iter().map(|c| c.sharding_item).collect();
        assert_eq!(items, (0..10).collect::<Vec<_>>());
        let ranges = bounds(&contexts);
        assert_eq!(ranges[0].0, 1);
        assert_eq!(ranges[9].1, 10_000_000);
        assert!(ranges.windows(2).all(|w| w[0].1 + 1 == w[1].0));
        assert_eq!(item.estimated_records(), 10_000_000);
    }

    #[tokio::test]
    async fn test_empty_table_yields_zero_range() {
        let source = MemoryDataSource::new("ds_0")
            .with_empty_table("t_order_0", vec![ColumnMetaData::new("order_id", "int")]);
        let item = job_item(source, &[("t_order_0", "t_order")]);
        let contexts = InventoryTaskSplitter::new(100)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].position, IngestPosition::integer(0, 0));
    }

    #[tokio::test]
    async fn test_composite_and_missing_keys_are_unsupported() {
        let source = MemoryDataSource::new("ds_0")
            .with_empty_table(
                "t_order_item",
                vec![
                    ColumnMetaData::new("order_id", "bigint"),
                    ColumnMetaData::new("item_id", "bigint"),
                ],
            )
            .with_empty_table("t_log", Vec::new())
            .with_empty_table("t_price", vec![ColumnMetaData::new("price", "decimal(10,2)")]);
        let item = job_item(source, &[("t_order_item", "t_order_item"), ("t_log", "t_log"), ("t_price", "t_price")]);
        let contexts = InventoryTaskSplitter::new(100)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap();

        assert_eq!(contexts.len(), 3);
        assert!(contexts.iter().all(|c| c.position == IngestPosition::UnsupportedKey));
        assert!(contexts.iter().all(|c| c.sharding_item == 0));
    }

    #[tokio::test]
    async fn test_string_key_is_one_open_unit() {
        let source = MemoryDataSource::new("ds_0")
            .with_empty_table("t_user", vec![ColumnMetaData::new("user_name", "varchar(64)")])
            .with_estimated_count("t_user", Some(5_000));
        let item = job_item(source, &[("t_user", "t_user")]);
        let contexts = InventoryTaskSplitter::new(100)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap();
        assert_eq!(
            contexts[0].position,
            IngestPosition::StringPrimaryKey {
                lower_bound: None,
                upper_bound: None
            }
        );
    }

    #[tokio::test]
    async fn test_resume_reuses_positions_in_item_order() {
        let source = MemoryDataSource::new("ds_0")
            .with_sequential_table("t_order_0", "order_id", 1..=100)
            .with_failing_counts();
        let mut progress = JobItemProgress::default();
        progress.inventory.insert("ds_0.t_order_0#10".into(), IngestPosition::integer(91, 100));
        progress.inventory.insert("ds_0.t_order_0#2".into(), IngestPosition::Finished);
        progress.inventory.insert("ds_0.t_order_0#0".into(), IngestPosition::integer(5, 45));
        progress.inventory.insert("ds_0.t_order_00#0".into(), IngestPosition::integer(1, 1));

        let mut item = job_item(source, &[("t_order_0", "t_order")]);
        item.init_progress = Some(progress);

        // Counting would fail; resumed splits never count
        let contexts = InventoryTaskSplitter::new(10)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap();
        let positions: Vec<IngestPosition> = contexts.iter().map(|c| c.position.clone()).collect();
        assert_eq!(
            positions,
            vec![
                IngestPosition::integer(5, 45),
                IngestPosition::Finished,
                IngestPosition::integer(91, 100)
            ]
        );
        let ids: Vec<String> = contexts.iter().map(|c| c.task_id()).collect();
        assert_eq!(ids, vec!["ds_0.t_order_0#0", "ds_0.t_order_0#2", "ds_0.t_order_0#10"]);
    }

    #[tokio::test]
    async fn test_count_failure_is_typed() {
        let source = MemoryDataSource::new("ds_0")
            .with_sequential_table("t_order_0", "order_id", 1..=10)
            .with_failing_counts();
        let item = job_item(source, &[("t_order_0", "t_order")]);
        let err = InventoryTaskSplitter::new(10)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap_err();
        match err {
            Error::SplitByUniqueKey { table, unique_key, .. } => {
                assert_eq!(table, "t_order_0");
                assert_eq!(unique_key, "order_id");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_estimate_falls_back_to_exact_count() {
        let source = MemoryDataSource::new("ds_0")
            .with_sequential_table("t_order_0", "order_id", 1..=42)
            .with_estimated_count("t_order_0", Some(0));
        let rows = estimate_row_count(&source, &TableName::new(None, "t_order_0"), Some("order_id"))
            .await
            .unwrap();
        assert_eq!(rows, 42);
    }

    #[tokio::test]
    async fn test_stale_estimate_on_empty_table_yields_zero_range() {
        let source = MemoryDataSource::new("ds_0")
            .with_empty_table("t_order_0", vec![ColumnMetaData::new("order_id", "int")])
            .with_estimated_count("t_order_0", Some(500));
        let item = job_item(source, &[("t_order_0", "t_order")]);
        let contexts = InventoryTaskSplitter::new(100)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].position, IngestPosition::integer(0, 0));
    }

    #[tokio::test]
    async fn test_rows_without_integer_range_fail_split() {
        let big = u64::MAX - 5;
        let rows = (0..3u64)
            .map(|i| vec![("order_id".to_string(), ColumnValue::UInt(big + i))])
            .collect();
        let source = MemoryDataSource::new("ds_0")
            .with_table("t_order_0", vec![ColumnMetaData::new("order_id", "bigint")], rows)
            .with_estimated_count("t_order_0", Some(3));
        let item = job_item(source, &[("t_order_0", "t_order")]);
        let err = InventoryTaskSplitter::new(100)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SplitByUniqueKey { ref table, .. } if table == "t_order_0"));
    }

    #[tokio::test]
    async fn test_unsigned_bigint_key_is_copied_whole() {
        let source = MemoryDataSource::new("ds_0")
            .with_empty_table("t_order_0", vec![ColumnMetaData::new("order_id", "bigint(20) unsigned")])
            .with_estimated_count("t_order_0", Some(3));
        let item = job_item(source, &[("t_order_0", "t_order")]);
        let contexts = InventoryTaskSplitter::new(100)
            .split_inventory_dumper_contexts(&item)
            .await
            .unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].position, IngestPosition::UnsupportedKey);
    }
}
