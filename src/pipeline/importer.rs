//! Importer
//!
//! Drains one channel into the target sink in the order batches were pushed,
//! acknowledging each batch after it is written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::channel::{ChannelReceiver, FetchResult};
use super::record::Record;
use super::source::PipelineSink;
use super::task::TaskOutcome;
use crate::error::Result;

pub struct Importer {
    task_id: String,
    channel: ChannelReceiver,
    sink: Arc<dyn PipelineSink>,
    /// Bounded wait for each fetch
    timeout: Duration,
    processed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Importer {
    pub fn new(
        task_id: impl Into<String>,
        channel: ChannelReceiver,
        sink: Arc<dyn PipelineSink>,
        timeout: Duration,
        processed: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            channel,
            sink,
            timeout,
            processed,
            cancel,
        }
    }

    /// Import until a finish record arrives, the dumper side closes, or
    /// cancellation is observed between batches
    pub async fn run(mut self) -> Result<TaskOutcome> {
        loop {
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(TaskOutcome::Cancelled),
                fetched = self.channel.fetch(self.timeout) => fetched,
            };

            let records = match fetched {
                FetchResult::Records(records) => records,
                FetchResult::Timeout => {
                    tracing::trace!("Importer {} waiting for records", self.task_id);
                    continue;
                }
                FetchResult::Closed => {
                    // Dumper ended without a finish record
                    tracing::debug!("Importer {} channel closed before finish", self.task_id);
                    return Ok(TaskOutcome::Cancelled);
                }
            };

            let finished = records.iter().any(|r| matches!(r, Record::Finished));
            let data: Vec<_> = records
                .iter()
                .filter_map(|r| match r {
                    Record::Data(record) => Some(record.clone()),
                    Record::Finished => None,
                })
                .collect();

            if !data.is_empty() {
                let written = self.sink.write(&data).await?;
                self.processed.fetch_add(written, Ordering::Relaxed);
            }
            self.channel.ack(&records);

            if finished {
                tracing::debug!("Importer {} finished", self.task_id);
                return Ok(TaskOutcome::Finished);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::create_channel;
    use crate::pipeline::position::{IngestPosition, PositionCell};
    use crate::pipeline::record::{DataRecord, Operation};
    use crate::pipeline::testing::MemorySink;

    fn record(key: i64) -> Record {
        Record::Data(DataRecord::new(Operation::Insert, "t_order", IngestPosition::integer(key, 100)))
    }

    fn importer(rx: ChannelReceiver, sink: Arc<MemorySink>, cancel: CancellationToken) -> (Importer, Arc<AtomicU64>) {
        let processed = Arc::new(AtomicU64::new(0));
        let importer = Importer::new(
            "ds_0.t_order_0#0",
            rx,
            sink,
            Duration::from_millis(20),
            processed.clone(),
            cancel,
        );
        (importer, processed)
    }

    #[tokio::test]
    async fn test_writes_in_order_and_acks() {
        let cell = PositionCell::new(IngestPosition::integer(1, 100));
        let (tx, rx) = create_channel(4, cell.clone());
        let sink = Arc::new(MemorySink::default());
        let (importer, processed) = importer(rx, sink.clone(), CancellationToken::new());

        tx.push(vec![record(1), record(2)]).await.unwrap();
        tx.push(vec![record(3), Record::Finished]).await.unwrap();

        assert_eq!(importer.run().await.unwrap(), TaskOutcome::Finished);
        assert_eq!(processed.load(Ordering::Relaxed), 3);
        assert!(cell.is_finished());

        let written: Vec<IngestPosition> = sink.records().into_iter().map(|r| r.position).collect();
        assert_eq!(
            written,
            vec![
                IngestPosition::integer(1, 100),
                IngestPosition::integer(2, 100),
                IngestPosition::integer(3, 100)
            ]
        );
    }

    #[tokio::test]
    async fn test_waits_through_timeouts_until_dumper_finishes() {
        let cell = PositionCell::default();
        let (tx, rx) = create_channel(1, cell.clone());
        let sink = Arc::new(MemorySink::default());
        let (importer, _) = importer(rx, sink.clone(), CancellationToken::new());
        let handle = tokio::spawn(importer.run());

        // Several fetch timeouts pass before the slow dumper delivers
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        tx.push(vec![record(5), Record::Finished]).await.unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), TaskOutcome::Finished);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_without_finish_is_not_finished() {
        let cell = PositionCell::new(IngestPosition::integer(1, 100));
        let (tx, rx) = create_channel(2, cell.clone());
        let sink = Arc::new(MemorySink::default());
        let (importer, _) = importer(rx, sink, CancellationToken::new());

        tx.push(vec![record(9)]).await.unwrap();
        drop(tx);

        assert_eq!(importer.run().await.unwrap(), TaskOutcome::Cancelled);
        assert_eq!(cell.get(), IngestPosition::integer(9, 100));
    }

    #[tokio::test]
    async fn test_cancelled_importer_stops() {
        let (_tx, rx) = create_channel(1, PositionCell::default());
        let cancel = CancellationToken::new();
        let (importer, _) = importer(rx, Arc::new(MemorySink::default()), cancel.clone());
        cancel.cancel();
        assert_eq!(importer.run().await.unwrap(), TaskOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_acknowledged() {
        let cell = PositionCell::new(IngestPosition::integer(1, 100));
        let (tx, rx) = create_channel(1, cell.clone());
        let sink = Arc::new(MemorySink::failing());
        let (importer, _) = importer(rx, sink, CancellationToken::new());

        tx.push(vec![record(50)]).await.unwrap();
        assert!(importer.run().await.is_err());
        assert_eq!(cell.get(), IngestPosition::integer(1, 100));
    }
}
