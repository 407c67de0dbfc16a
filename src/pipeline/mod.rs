//! Data Migration Pipeline Module
//!
//! Splits source tables into resumable dump units and copies them into the
//! target through bounded dumper → importer channels, checkpointing
//! positions as batches land.

mod binlog;
mod channel;
mod consistency;
mod context;
mod dumper;
mod importer;
mod incremental;
mod job;
pub mod mysql;
mod position;
mod rate_limit;
mod record;
mod resume;
mod source;
mod splitter;
mod sql;
mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use binlog::MySqlIncrementalDumper;
pub use channel::{create_channel, ChannelReceiver, ChannelSender, FetchResult};
pub use consistency::{
    CheckMethod, ConsistencyCheckReport, ConsistencyChecker, KeyRange, TableCheckResult, DEFAULT_CHECK_BATCH_SIZE,
};
pub use context::{task_id, InventoryDumperContext, TableAndSchemaNameMapper};
pub use dumper::InventoryDumper;
pub use importer::Importer;
pub use incremental::{init_incremental_position, IncrementalDumper, IncrementalTask};
pub use job::{
    require_tables, JobItemContext, JobItemProgress, JobSettings, JobStatus, MigrationJob,
    MIGRATION_PROCESS_KIND,
};
pub use mysql::{MySqlDataSource, MySqlSink};
pub use position::{split_integer_range, IngestPosition, PositionCell};
pub use rate_limit::{RateLimitAlgorithm, RateLimiter};
pub use record::{Column, ColumnValue, DataRecord, Operation, Record};
pub use resume::{load_checkpoint, ResumeManager, DEFAULT_PERSIST_INTERVAL};
pub use source::{ColumnMetaData, DumpFilter, DumpQuery, KeyKind, PipelineDataSource, PipelineSink, Row};
pub use splitter::{estimate_row_count, InventoryTaskSplitter};
pub use sql::{Dialect, PipelineSqlBuilder, SqlStatement, TableName};
pub use task::{all_finished, InventoryTask, TaskExecutor, TaskOutcome, TaskSettings};
