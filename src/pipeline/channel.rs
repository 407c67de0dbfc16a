//! Dumper → Importer Channel
//!
//! A bounded, ordered hand-off of record batches. The dumper pushes, the
//! importer fetches with a bounded wait and acknowledges what it wrote; the
//! acknowledgement advances the task's shared position.

use std::time::Duration;

use tokio::sync::mpsc;

use super::position::PositionCell;
use super::record::Record;
use crate::error::{Error, Result};

/// Outcome of one importer fetch
#[derive(Debug, PartialEq)]
pub enum FetchResult {
    Records(Vec<Record>),
    /// Nothing arrived within the wait; the dumper is still running
    Timeout,
    /// The dumper has finished and every batch was fetched
    Closed,
}

/// Create a channel holding at most `capacity` batches.
///
/// Acknowledged positions are written to `ack_position`.
pub fn create_channel(capacity: usize, ack_position: PositionCell) -> (ChannelSender, ChannelReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSender { tx },
        ChannelReceiver {
            rx,
            ack_position,
        },
    )
}

/// Dumper side
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Vec<Record>>,
}

impl ChannelSender {
    /// Push one batch, waiting while the channel is full
    pub async fn push(&self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.tx
            .send(records)
            .await
            .map_err(|_| Error::Pipeline("Importer side of the channel is closed".into()))
    }
}

/// Importer side
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::Receiver<Vec<Record>>,
    ack_position: PositionCell,
}

impl ChannelReceiver {
    /// Fetch the next batch, waiting at most `timeout`
    pub async fn fetch(&mut self, timeout: Duration) -> FetchResult {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(records)) => FetchResult::Records(records),
            Ok(None) => FetchResult::Closed,
            Err(_) => FetchResult::Timeout,
        }
    }

    /// Acknowledge a written batch: the position of its last record becomes
    /// the task position
    pub fn ack(&self, records: &[Record]) {
        if let Some(last) = records.last() {
            self.ack_position.set(last.position());
        }
    }

    pub fn position(&self) -> &PositionCell {
        &self.ack_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::position::IngestPosition;
    use crate::pipeline::record::{DataRecord, Operation};

    fn record(lower: i64, upper: i64) -> Record {
        Record::Data(DataRecord::new(
            Operation::Insert,
            "t_order",
            IngestPosition::integer(lower, upper),
        ))
    }

    #[tokio::test]
    async fn test_fetch_preserves_order() {
        let (tx, mut rx) = create_channel(4, PositionCell::default());
        tx.push(vec![record(1, 10)]).await.unwrap();
        tx.push(vec![record(2, 10), record(3, 10)]).await.unwrap();

        let timeout = Duration::from_millis(50);
        assert_eq!(rx.fetch(timeout).await, FetchResult::Records(vec![record(1, 10)]));
        assert_eq!(
            rx.fetch(timeout).await,
            FetchResult::Records(vec![record(2, 10), record(3, 10)])
        );
    }

    #[tokio::test]
    async fn test_timeout_then_closed() {
        let (tx, mut rx) = create_channel(1, PositionCell::default());
        assert_eq!(rx.fetch(Duration::from_millis(20)).await, FetchResult::Timeout);

        tx.push(vec![Record::Finished]).await.unwrap();
        drop(tx);
        assert_eq!(
            rx.fetch(Duration::from_millis(20)).await,
            FetchResult::Records(vec![Record::Finished])
        );
        assert_eq!(rx.fetch(Duration::from_millis(20)).await, FetchResult::Closed);
    }

    #[tokio::test]
    async fn test_ack_advances_position() {
        let cell = PositionCell::new(IngestPosition::integer(1, 10));
        let (_tx, rx) = create_channel(1, cell.clone());

        rx.ack(&[record(4, 10), record(6, 10)]);
        assert_eq!(cell.get(), IngestPosition::integer(6, 10));

        rx.ack(&[]);
        assert_eq!(cell.get(), IngestPosition::integer(6, 10));

        rx.ack(&[Record::Finished]);
        assert!(cell.is_finished());
    }

    #[tokio::test]
    async fn test_push_after_importer_dropped() {
        let (tx, rx) = create_channel(1, PositionCell::default());
        drop(rx);
        assert!(tx.push(vec![record(1, 1)]).await.is_err());
    }
}
