//! Inventory Tasks and Task Execution
//!
//! An inventory task pairs a dumper and an importer over one channel. The
//! executor runs many tasks at once, bounded by separate dump-side and
//! import-side pools.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::channel::create_channel;
use super::context::InventoryDumperContext;
use super::dumper::InventoryDumper;
use super::importer::Importer;
use super::position::{IngestPosition, PositionCell};
use super::source::{PipelineDataSource, PipelineSink};
use crate::error::{Error, Result};

/// How a task run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished,
    /// Stopped before the unit was exhausted; resumable
    Cancelled,
}

impl TaskOutcome {
    /// Combine the dumper and importer outcomes of one task
    pub fn and(self, other: TaskOutcome) -> TaskOutcome {
        if self == TaskOutcome::Finished && other == TaskOutcome::Finished {
            TaskOutcome::Finished
        } else {
            TaskOutcome::Cancelled
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Finished => write!(f, "FINISHED"),
            TaskOutcome::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Channel and importer settings shared by every task of a job
#[derive(Debug, Clone, Copy)]
pub struct TaskSettings {
    /// Channel capacity in batches
    pub channel_capacity: usize,
    pub importer_timeout: Duration,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            importer_timeout: Duration::from_millis(3000),
        }
    }
}

/// One dump unit wired to its importer
pub struct InventoryTask {
    task_id: String,
    position: PositionCell,
    dumper: InventoryDumper,
    importer: Importer,
    cancel: CancellationToken,
}

impl InventoryTask {
    pub fn new(
        context: InventoryDumperContext,
        source: Arc<dyn PipelineDataSource>,
        sink: Arc<dyn PipelineSink>,
        settings: TaskSettings,
        processed: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        let task_id = context.task_id();
        let position = PositionCell::new(context.position.clone());
        let (sender, receiver) = create_channel(settings.channel_capacity, position.clone());

        let importer = Importer::new(
            task_id.clone(),
            receiver,
            sink,
            settings.importer_timeout,
            processed,
            cancel.clone(),
        );
        let dumper = InventoryDumper::new(context, source, sender, cancel.clone());

        Self {
            task_id,
            position,
            dumper,
            importer,
            cancel,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The task's position cell, advanced as batches are written
    pub fn position(&self) -> PositionCell {
        self.position.clone()
    }

    pub fn context(&self) -> &InventoryDumperContext {
        self.dumper.context()
    }
}

/// Runs tasks with bounded dump and import concurrency
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    dump_permits: Arc<Semaphore>,
    import_permits: Arc<Semaphore>,
}

impl TaskExecutor {
    pub fn new(dump_workers: usize, import_workers: usize) -> Self {
        Self {
            dump_permits: Arc::new(Semaphore::new(dump_workers.max(1))),
            import_permits: Arc::new(Semaphore::new(import_workers.max(1))),
        }
    }

    /// Run one task to completion.
    ///
    /// Both permits are taken before either side starts, dump first, so two
    /// tasks never hold one permit each while waiting on the other. The dump
    /// permit is released as soon as the dumper ends.
    pub async fn execute(&self, task: InventoryTask) -> Result<TaskOutcome> {
        let InventoryTask {
            task_id,
            position,
            dumper,
            importer,
            cancel,
        } = task;

        if position.is_finished() {
            tracing::debug!("Inventory task {} already finished", task_id);
            return Ok(TaskOutcome::Finished);
        }

        let dump_permit = tokio::select! {
            permit = self.dump_permits.clone().acquire_owned() => permit.map_err(|_| Error::ShuttingDown)?,
            _ = cancel.cancelled() => return Ok(TaskOutcome::Cancelled),
        };
        let import_permit = tokio::select! {
            permit = self.import_permits.clone().acquire_owned() => permit.map_err(|_| Error::ShuttingDown)?,
            _ = cancel.cancelled() => return Ok(TaskOutcome::Cancelled),
        };

        tracing::info!("Inventory task {} started at {}", task_id, position.get());
        let dumping = tokio::spawn(async move {
            let _permit = dump_permit;
            dumper.run().await
        });
        let importing = tokio::spawn(async move {
            let _permit = import_permit;
            importer.run().await
        });
        let (dumped, imported) = tokio::join!(dumping, importing);

        let dumped = dumped.map_err(|e| Error::Internal(format!("dumper {} panicked: {}", task_id, e)))?;
        let imported = imported.map_err(|e| Error::Internal(format!("importer {} panicked: {}", task_id, e)))?;

        let outcome = match (dumped, imported) {
            (_, Err(e)) => {
                tracing::error!("Inventory task {} import failed: {}", task_id, e);
                return Err(e);
            }
            (Err(Error::Cancelled), Ok(imported)) => imported.and(TaskOutcome::Cancelled),
            // The importer stopped first and closed the channel under the dumper
            (Err(e), Ok(TaskOutcome::Cancelled)) if cancel.is_cancelled() => {
                tracing::debug!("Inventory task {} dumper stopped by cancellation: {}", task_id, e);
                TaskOutcome::Cancelled
            }
            (Err(e), Ok(_)) => {
                tracing::error!("Inventory task {} dump failed: {}", task_id, e);
                return Err(e);
            }
            (Ok(dumped), Ok(imported)) => dumped.and(imported),
        };

        tracing::info!("Inventory task {} {} at {}", task_id, outcome, position.get());
        Ok(outcome)
    }

    /// Run tasks concurrently; the first error is returned once all have ended
    pub async fn execute_all(&self, tasks: Vec<InventoryTask>) -> Result<TaskOutcome> {
        let runs = tasks.into_iter().map(|task| {
            let executor = self.clone();
            tokio::spawn(async move { executor.execute(task).await })
        });
        let results = futures::future::join_all(runs).await;

        let mut outcome = TaskOutcome::Finished;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(Ok(task_outcome)) => outcome = outcome.and(task_outcome),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::Internal(format!("inventory task panicked: {}", e)));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }
}

/// True when every position has been dumped
pub fn all_finished<'a>(positions: impl IntoIterator<Item = &'a IngestPosition>) -> bool {
    positions.into_iter().all(IngestPosition::is_finished)
}
