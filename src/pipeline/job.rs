//! Migration Jobs
//!
//! A migration job item copies a set of source tables into the target: it
//! splits the tables into inventory tasks, runs them with checkpointing,
//! and then follows the source change stream when one is configured.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::context::{task_id_prefix, TableAndSchemaNameMapper};
use super::incremental::{init_incremental_position, IncrementalDumper, IncrementalTask};
use super::position::{IngestPosition, PositionCell};
use super::rate_limit::{RateLimitAlgorithm, RateLimiter};
use super::resume::{load_checkpoint, ResumeManager, DEFAULT_PERSIST_INTERVAL};
use super::source::{PipelineDataSource, PipelineSink};
use super::splitter::InventoryTaskSplitter;
use super::task::{TaskExecutor, TaskOutcome, TaskSettings};
use crate::cluster::{paths, ContextManager, ProcessInfo};
use crate::config::{PipelineConfig, TableMappingConfig};
use crate::error::{Error, Result};
use crate::repository::PersistRepository;

/// Process kind shown in the process list
pub const MIGRATION_PROCESS_KIND: &str = "MIGRATION";

const STATUS: &str = "status";

/// Lifecycle of a job item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Preparing,
    ExecuteInventoryTask,
    ExecuteIncrementalTask,
    Finished,
    Stopping,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Preparing => "PREPARING",
            JobStatus::ExecuteInventoryTask => "EXECUTE_INVENTORY_TASK",
            JobStatus::ExecuteIncrementalTask => "EXECUTE_INCREMENTAL_TASK",
            JobStatus::Finished => "FINISHED",
            JobStatus::Stopping => "STOPPING",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            JobStatus::Preparing,
            JobStatus::ExecuteInventoryTask,
            JobStatus::ExecuteIncrementalTask,
            JobStatus::Finished,
            JobStatus::Stopping,
            JobStatus::Stopped,
            JobStatus::Failed,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted progress of a job item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobItemProgress {
    pub status: JobStatus,
    /// Inventory task id → position
    pub inventory: BTreeMap<String, IngestPosition>,
    /// Data source name → change log position
    pub incremental: BTreeMap<String, IngestPosition>,
}

impl JobItemProgress {
    /// Load the progress persisted for a job item; None when nothing was saved
    pub async fn load(
        repository: &dyn PersistRepository,
        job_id: &str,
        sharding_item: usize,
    ) -> Result<Option<Self>> {
        let path = paths::job_item(job_id, sharding_item);
        let (inventory, incremental) = load_checkpoint(repository, &path).await?;
        let status = repository
            .get(&format!("{}/{}", path, STATUS))
            .await?
            .and_then(|value| JobStatus::parse(&value));
        if inventory.is_empty() && incremental.is_empty() && status.is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            status: status.unwrap_or_default(),
            inventory,
            incremental,
        }))
    }

    /// Persisted positions of one table's units, ordered by sharding item
    pub fn table_positions(&self, data_source_name: &str, actual_table: &str) -> Vec<(usize, IngestPosition)> {
        let prefix = format!("{}#", task_id_prefix(data_source_name, actual_table));
        let mut positions: Vec<(usize, IngestPosition)> = self
            .inventory
            .iter()
            .filter_map(|(task_id, position)| {
                let item = task_id.strip_prefix(&prefix)?.parse().ok()?;
                Some((item, position.clone()))
            })
            .collect();
        positions.sort_by_key(|(item, _)| *item);
        positions
    }

    /// Share of inventory units already finished, 0 to 100
    pub fn inventory_finished_percentage(&self) -> u32 {
        if self.inventory.is_empty() {
            return 0;
        }
        let finished = self.inventory.values().filter(|p| p.is_finished()).count();
        (finished * 100 / self.inventory.len()) as u32
    }
}

/// Runtime state of one job item
pub struct JobItemContext {
    pub job_id: String,
    pub sharding_item: usize,
    /// Actual → logical table map, in split order
    pub tables: Vec<TableMappingConfig>,
    pub schema_mapper: Arc<TableAndSchemaNameMapper>,
    pub source: Arc<dyn PipelineDataSource>,
    /// Progress of a previous run, when resuming
    pub init_progress: Option<JobItemProgress>,
    pub batch_size: usize,
    pub rate_limiter: RateLimiter,
    pub processed_records: Arc<AtomicU64>,
    status: RwLock<JobStatus>,
    estimated_records: AtomicU64,
}

impl JobItemContext {
    pub fn new(
        job_id: impl Into<String>,
        sharding_item: usize,
        tables: Vec<TableMappingConfig>,
        source: Arc<dyn PipelineDataSource>,
    ) -> Self {
        let schema_mapper = Arc::new(TableAndSchemaNameMapper::new(&tables));
        Self {
            job_id: job_id.into(),
            sharding_item,
            tables,
            schema_mapper,
            source,
            init_progress: None,
            batch_size: 1000,
            rate_limiter: RateLimiter::unlimited(),
            processed_records: Arc::new(AtomicU64::new(0)),
            status: RwLock::new(JobStatus::Preparing),
            estimated_records: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: JobStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn estimated_records(&self) -> u64 {
        self.estimated_records.load(Ordering::Relaxed)
    }

    pub fn add_estimated_records(&self, rows: u64) {
        self.estimated_records.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn processed_records(&self) -> u64 {
        self.processed_records.load(Ordering::Relaxed)
    }

    /// Checkpoint path of this job item
    pub fn path(&self) -> String {
        paths::job_item(&self.job_id, self.sharding_item)
    }
}

/// Tuning shared by every task of a job
#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub batch_size: usize,
    pub shard_size: u64,
    pub dump_workers: usize,
    pub import_workers: usize,
    pub task: TaskSettings,
    pub rate_limit_rows_per_sec: u64,
    pub persist_interval: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            shard_size: 1_000_000,
            dump_workers: 4,
            import_workers: 4,
            task: TaskSettings::default(),
            rate_limit_rows_per_sec: 0,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
        }
    }
}

impl JobSettings {
    /// Settings from `[pipeline]`; worker counts come resolved by the caller
    pub fn from_config(config: &PipelineConfig, dump_workers: usize, import_workers: usize) -> Self {
        Self {
            batch_size: config.batch_size,
            shard_size: config.shard_size,
            dump_workers,
            import_workers,
            task: TaskSettings {
                channel_capacity: config.channel_capacity,
                importer_timeout: Duration::from_millis(config.importer_timeout_ms),
            },
            rate_limit_rows_per_sec: config.rate_limit_rows_per_sec,
            persist_interval: Duration::from_secs(config.persist_interval_secs),
        }
    }
}

/// One migration job item
pub struct MigrationJob {
    job_id: String,
    sharding_item: usize,
    tables: Vec<TableMappingConfig>,
    source: Arc<dyn PipelineDataSource>,
    sink: Arc<dyn PipelineSink>,
    repository: Arc<dyn PersistRepository>,
    settings: JobSettings,
    incremental: Option<Arc<dyn IncrementalDumper>>,
    context: Option<Arc<ContextManager>>,
}

impl MigrationJob {
    pub fn new(
        job_id: impl Into<String>,
        sharding_item: usize,
        tables: Vec<TableMappingConfig>,
        source: Arc<dyn PipelineDataSource>,
        sink: Arc<dyn PipelineSink>,
        repository: Arc<dyn PersistRepository>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            sharding_item,
            tables,
            source,
            sink,
            repository,
            settings: JobSettings::default(),
            incremental: None,
            context: None,
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Follow the source change stream after the inventory dump
    pub fn with_incremental(mut self, dumper: Arc<dyn IncrementalDumper>) -> Self {
        self.incremental = Some(dumper);
        self
    }

    /// Register the running job in this node's process list
    pub fn with_context(mut self, context: Arc<ContextManager>) -> Self {
        self.context = Some(context);
        self
    }

    /// Id under which the running job is listed and killed
    pub fn process_id(&self) -> String {
        format!("{}_{}", self.job_id, self.sharding_item)
    }

    /// Run the job item to completion, cancellation or failure.
    ///
    /// Returns the final status. Progress is checkpointed throughout and once
    /// more before returning, so a stopped or failed item resumes where it
    /// left off.
    pub async fn run(&self, cancel: CancellationToken) -> Result<JobStatus> {
        let process = match &self.context {
            Some(context) => {
                let mut info = ProcessInfo::new(
                    self.process_id(),
                    MIGRATION_PROCESS_KIND,
                    format!("migrate {} table(s) from {}", self.tables.len(), self.source.name()),
                );
                info.instance_id = context.instances().local_id().await;
                Some(context.processes().register(info))
            }
            None => None,
        };
        let cancel = match &process {
            Some(handle) => {
                let killed = handle.cancel_token();
                let job_cancel = cancel.child_token();
                let linked = job_cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = killed.cancelled() => linked.cancel(),
                        _ = linked.cancelled() => {}
                    }
                });
                job_cancel
            }
            None => cancel.child_token(),
        };

        let path = paths::job_item(&self.job_id, self.sharding_item);
        let resume = ResumeManager::open(self.repository.clone(), path.clone(), self.settings.persist_interval).await?;

        let mut job_item = JobItemContext::new(
            self.job_id.clone(),
            self.sharding_item,
            self.tables.clone(),
            self.source.clone(),
        );
        job_item.batch_size = self.settings.batch_size;
        job_item.rate_limiter = RateLimiter::new(RateLimitAlgorithm::from_rows_per_sec(
            self.settings.rate_limit_rows_per_sec,
        ));
        let loaded = resume.inventory_positions();
        if !loaded.is_empty() {
            tracing::info!("Resuming job {} item {} with {} saved unit(s)", self.job_id, self.sharding_item, loaded.len());
            job_item.init_progress = Some(JobItemProgress {
                status: JobStatus::Preparing,
                inventory: loaded,
                incremental: resume.incremental_positions(),
            });
        }

        let result = self.execute(&job_item, &resume, &cancel).await;
        let status = match &result {
            Ok(status) => *status,
            Err(e) => {
                tracing::error!("Job {} item {} failed: {}", self.job_id, self.sharding_item, e);
                JobStatus::Failed
            }
        };
        self.update_status(&job_item, status).await;

        // Final checkpoint regardless of outcome
        if let Err(e) = resume.close().await {
            tracing::error!("Final checkpoint of {} failed: {}", path, e);
            if result.is_ok() {
                return Err(e);
            }
        }
        cancel.cancel();
        drop(process);
        tracing::info!(
            "Job {} item {} {}: {} of ~{} records processed",
            self.job_id,
            self.sharding_item,
            status,
            job_item.processed_records(),
            job_item.estimated_records()
        );
        result
    }

    async fn execute(
        &self,
        job_item: &JobItemContext,
        resume: &ResumeManager,
        cancel: &CancellationToken,
    ) -> Result<JobStatus> {
        self.update_status(job_item, JobStatus::Preparing).await;

        let splitter = InventoryTaskSplitter::new(self.settings.shard_size);
        let tasks = splitter
            .split_inventory_tasks(job_item, self.sink.clone(), self.settings.task, cancel)
            .await?;
        for task in &tasks {
            resume.register_inventory(task.task_id(), task.position());
        }

        let incremental_position = match &self.incremental {
            Some(_) => Some(self.incremental_position(resume).await?),
            None => None,
        };

        self.update_status(job_item, JobStatus::ExecuteInventoryTask).await;
        let executor = TaskExecutor::new(self.settings.dump_workers, self.settings.import_workers);
        if executor.execute_all(tasks).await? == TaskOutcome::Cancelled {
            return Ok(JobStatus::Stopped);
        }
        tracing::info!("Job {} item {} inventory finished", self.job_id, self.sharding_item);

        let (Some(dumper), Some(position)) = (&self.incremental, incremental_position) else {
            return Ok(JobStatus::Finished);
        };
        self.update_status(job_item, JobStatus::ExecuteIncrementalTask).await;
        let task = IncrementalTask::new(
            self.source.name(),
            position,
            dumper.clone(),
            self.sink.clone(),
            self.settings.task,
            job_item.processed_records.clone(),
            cancel.clone(),
        );
        task.run().await?;
        Ok(JobStatus::Stopped)
    }

    /// Saved change log position when the checkpoint is resumable, else the
    /// source's current one
    async fn incremental_position(&self, resume: &ResumeManager) -> Result<PositionCell> {
        let key = self.source.name().to_string();
        let saved = if resume.is_resumable() {
            resume.incremental_positions().remove(&key)
        } else {
            None
        };
        let position = match saved {
            Some(position) => position,
            None => init_incremental_position(self.source.as_ref()).await?,
        };
        let cell = PositionCell::new(position);
        resume.register_incremental(key, cell.clone());
        Ok(cell)
    }

    async fn update_status(&self, job_item: &JobItemContext, status: JobStatus) {
        job_item.set_status(status);
        let key = format!("{}/{}", job_item.path(), STATUS);
        if let Err(e) = self.repository.persist(&key, status.as_str()).await {
            tracing::warn!("Failed to persist status of job {}: {}", self.job_id, e);
        }
    }
}

/// Guard against a job item running without any tables
pub fn require_tables(tables: &[TableMappingConfig]) -> Result<()> {
    if tables.is_empty() {
        return Err(Error::Config("pipeline.tables must list at least one table".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{test_support, InstanceType};
    use crate::pipeline::testing::{MemoryDataSource, MemorySink};
    use crate::repository::RegistryRepository;

    fn tables() -> Vec<TableMappingConfig> {
        vec![TableMappingConfig {
            actual: "t_order_0".into(),
            logical: "t_order".into(),
            schema: None,
        }]
    }

    fn settings() -> JobSettings {
        JobSettings {
            batch_size: 10,
            shard_size: 25,
            dump_workers: 2,
            import_workers: 2,
            task: TaskSettings {
                channel_capacity: 2,
                importer_timeout: Duration::from_millis(20),
            },
            rate_limit_rows_per_sec: 0,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
        }
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(JobStatus::parse("execute_inventory_task"), Some(JobStatus::ExecuteInventoryTask));
        assert_eq!(JobStatus::parse("nope"), None);
        assert_eq!(serde_json::to_string(&JobStatus::Failed).unwrap(), "\"FAILED\"");
    }

    #[test]
    fn test_progress_percentage() {
        let mut progress = JobItemProgress::default();
        assert_eq!(progress.inventory_finished_percentage(), 0);
        progress.inventory.insert("ds_0.t#0".into(), IngestPosition::Finished);
        progress.inventory.insert("ds_0.t#1".into(), IngestPosition::integer(1, 5));
        assert_eq!(progress.inventory_finished_percentage(), 50);
    }

    #[tokio::test]
    async fn test_job_runs_to_finish_and_checkpoints() {
        let repo: Arc<dyn PersistRepository> = Arc::new(RegistryRepository::open_in_memory().unwrap());
        let source = Arc::new(MemoryDataSource::new("ds_0").with_sequential_table("t_order_0", "order_id", 1..=100));
        let sink = Arc::new(MemorySink::default());

        let job = MigrationJob::new("j1", 0, tables(), source, sink.clone(), repo.clone()).with_settings(settings());
        assert_eq!(job.run(CancellationToken::new()).await.unwrap(), JobStatus::Finished);
        assert_eq!(sink.records().len(), 100);

        let progress = JobItemProgress::load(repo.as_ref(), "j1", 0).await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::Finished);
        assert_eq!(progress.inventory.len(), 4);
        assert_eq!(progress.inventory_finished_percentage(), 100);
    }

    #[tokio::test]
    async fn test_rerun_of_finished_job_copies_nothing() {
        let repo: Arc<dyn PersistRepository> = Arc::new(RegistryRepository::open_in_memory().unwrap());
        let source = Arc::new(MemoryDataSource::new("ds_0").with_sequential_table("t_order_0", "order_id", 1..=30));

        let first = MigrationJob::new("j1", 0, tables(), source.clone(), Arc::new(MemorySink::default()), repo.clone())
            .with_settings(settings());
        first.run(CancellationToken::new()).await.unwrap();

        let sink = Arc::new(MemorySink::default());
        let second = MigrationJob::new("j1", 0, tables(), source, sink.clone(), repo).with_settings(settings());
        assert_eq!(second.run(CancellationToken::new()).await.unwrap(), JobStatus::Finished);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_killed_job_stops_unfinished() {
        let repo: Arc<dyn PersistRepository> = Arc::new(RegistryRepository::open_in_memory().unwrap());
        let context = test_support::context_with_repository("node-1", InstanceType::Proxy, repo.clone());
        let source = Arc::new(
            MemoryDataSource::new("ds_0")
                .with_sequential_table("t_order_0", "order_id", 1..=500)
                .with_fetch_delay(Duration::from_millis(20)),
        );
        let job = Arc::new(
            MigrationJob::new("j2", 0, tables(), source, Arc::new(MemorySink::default()), repo.clone())
                .with_settings(settings())
                .with_context(context.clone()),
        );

        let running = {
            let job = job.clone();
            tokio::spawn(async move { job.run(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(context.processes().kill(&job.process_id()));

        assert_eq!(running.await.unwrap().unwrap(), JobStatus::Stopped);
        assert!(!context.processes().contains(&job.process_id()));
        let progress = JobItemProgress::load(repo.as_ref(), "j2", 0).await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::Stopped);
        assert!(progress.inventory.values().any(|p| !p.is_finished()));
    }

    #[tokio::test]
    async fn test_split_failure_marks_job_failed() {
        let repo: Arc<dyn PersistRepository> = Arc::new(RegistryRepository::open_in_memory().unwrap());
        let source = Arc::new(
            MemoryDataSource::new("ds_0")
                .with_sequential_table("t_order_0", "order_id", 1..=10)
                .with_failing_counts(),
        );
        let job = MigrationJob::new("j3", 0, tables(), source, Arc::new(MemorySink::default()), repo.clone())
            .with_settings(settings());
        assert!(matches!(
            job.run(CancellationToken::new()).await,
            Err(Error::SplitByUniqueKey { .. })
        ));
        let progress = JobItemProgress::load(repo.as_ref(), "j3", 0).await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::Failed);
    }

    #[test]
    fn test_require_tables() {
        assert!(require_tables(&[]).is_err());
        assert!(require_tables(&tables()).is_ok());
    }
}
