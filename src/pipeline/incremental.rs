//! Incremental Tasks
//!
//! Change-stream capture runs beside the inventory dump: an
//! [`IncrementalDumper`] reads source changes from a log position and pushes
//! them through the same channel and importer machinery. The change-stream
//! reader itself is a collaborator supplied by the caller.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::channel::{create_channel, ChannelSender};
use super::importer::Importer;
use super::position::{IngestPosition, PositionCell};
use super::source::{PipelineDataSource, PipelineSink};
use super::task::{TaskOutcome, TaskSettings};
use crate::error::{Error, Result};

/// Reads change records from a source log
#[async_trait]
pub trait IncrementalDumper: Send + Sync {
    /// Push change records starting after `from` until cancelled.
    ///
    /// Each record carries the log position reached once it is applied.
    async fn dump(&self, from: IngestPosition, channel: ChannelSender, cancel: CancellationToken) -> Result<()>;
}

/// Seed an incremental position from the source's current log coordinates
pub async fn init_incremental_position(source: &dyn PipelineDataSource) -> Result<IngestPosition> {
    match source.current_log_position().await? {
        Some(position) => {
            tracing::info!("Incremental position of {} initialised at {}", source.name(), position);
            Ok(position)
        }
        None => Err(Error::Pipeline(format!(
            "{} has no change log position; enable binary logging",
            source.name()
        ))),
    }
}

/// Change capture for one source data source
pub struct IncrementalTask {
    task_id: String,
    position: PositionCell,
    dumper: Arc<dyn IncrementalDumper>,
    importer: Importer,
    channel: ChannelSender,
    cancel: CancellationToken,
}

impl IncrementalTask {
    pub fn new(
        data_source_name: &str,
        position: PositionCell,
        dumper: Arc<dyn IncrementalDumper>,
        sink: Arc<dyn PipelineSink>,
        settings: TaskSettings,
        processed: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        let task_id = format!("{}.incremental", data_source_name);
        let (channel, receiver) = create_channel(settings.channel_capacity, position.clone());
        let importer = Importer::new(
            task_id.clone(),
            receiver,
            sink,
            settings.importer_timeout,
            processed,
            cancel.clone(),
        );
        Self {
            task_id,
            position,
            dumper,
            importer,
            channel,
            cancel,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn position(&self) -> PositionCell {
        self.position.clone()
    }

    /// Capture changes until cancelled
    pub async fn run(self) -> Result<TaskOutcome> {
        let IncrementalTask {
            task_id,
            position,
            dumper,
            importer,
            channel,
            cancel,
        } = self;
        let from = position.get();
        tracing::info!("Incremental task {} started at {}", task_id, from);

        let dumping = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dumper.dump(from, channel, cancel).await })
        };
        let imported = importer.run().await;
        // The importer only stops early on error; stop the reader with it
        cancel.cancel();
        let dumped = dumping
            .await
            .map_err(|e| Error::Internal(format!("incremental dumper {} panicked: {}", task_id, e)))?;

        imported?;
        match dumped {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => return Err(e),
        }
        tracing::info!("Incremental task {} stopped at {}", task_id, position.get());
        Ok(TaskOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::record::{Column, ColumnValue, DataRecord, Operation, Record};
    use crate::pipeline::testing::{MemoryDataSource, MemorySink};
    use std::time::Duration;

    /// Emits a fixed list of changes, then waits for cancellation
    struct ScriptedDumper {
        changes: Vec<(i64, u64)>,
    }

    #[async_trait]
    impl IncrementalDumper for ScriptedDumper {
        async fn dump(&self, from: IngestPosition, channel: ChannelSender, cancel: CancellationToken) -> Result<()> {
            let IngestPosition::Binlog { file_name, position: start } = from else {
                return Err(Error::InvalidPosition(from.to_string()));
            };
            for (key, position) in self.changes.iter().filter(|(_, p)| *p > start) {
                let mut record = DataRecord::new(
                    Operation::Update,
                    "t_order",
                    IngestPosition::Binlog {
                        file_name: file_name.clone(),
                        position: *position,
                    },
                );
                record.add_column(Column::new("order_id", ColumnValue::Int(*key), true));
                channel.push(vec![Record::Data(record)]).await?;
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn binlog(position: u64) -> IngestPosition {
        IngestPosition::Binlog {
            file_name: "binlog.000001".into(),
            position,
        }
    }

    #[tokio::test]
    async fn test_init_position_from_source() {
        let source = MemoryDataSource::new("ds_0").with_log_position(binlog(4));
        assert_eq!(init_incremental_position(&source).await.unwrap(), binlog(4));

        let no_log = MemoryDataSource::new("ds_1");
        assert!(init_incremental_position(&no_log).await.is_err());
    }

    #[tokio::test]
    async fn test_applies_changes_until_cancelled() {
        let sink = Arc::new(MemorySink::default());
        let cancel = CancellationToken::new();
        let position = PositionCell::new(binlog(100));
        let task = IncrementalTask::new(
            "ds_0",
            position.clone(),
            Arc::new(ScriptedDumper {
                changes: vec![(1, 90), (2, 120), (3, 150)],
            }),
            sink.clone(),
            TaskSettings {
                channel_capacity: 4,
                importer_timeout: Duration::from_millis(20),
            },
            Arc::new(AtomicU64::new(0)),
            cancel.clone(),
        );
        assert_eq!(task.task_id(), "ds_0.incremental");
        let run = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Cancelled);
        assert_eq!(sink.records().len(), 2);
        assert_eq!(position.get(), binlog(150));
    }
}
