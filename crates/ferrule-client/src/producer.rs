//! Record batch producer feeding a bounded queue
//!
//! The producer runs as its own task. A full queue suspends it, which is the
//! only flow control between a fast ClickHouse response and a slow consumer.
//! Nothing marks the end of the stream inside the queue: consumers learn
//! about completion (and failure) by joining the producer task.

use crate::columnar::ColumnarDecoder;
use arrow_array::RecordBatch;
use ferrule_common::{FerruleError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Sending half of a record batch queue
pub type BatchSender = mpsc::Sender<RecordBatch>;

/// Receiving half of a record batch queue
pub type BatchReceiver = mpsc::Receiver<RecordBatch>;

/// Create a bounded record batch queue holding at most `capacity` batches
pub fn record_batch_queue(capacity: usize) -> (BatchSender, BatchReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Decode every batch and push it into `queue` in order.
///
/// Returns the number of batches pushed. Decode and transport errors are
/// returned as-is; a consumer that hangs up yields [`FerruleError::QueueClosed`].
pub async fn produce<D>(decoder: &mut D, queue: &BatchSender) -> Result<u64>
where
    D: ColumnarDecoder + ?Sized,
{
    let mut produced = 0u64;

    while let Some(batch) = decoder.next_batch().await? {
        let rows = batch.num_rows();
        queue
            .send(batch)
            .await
            .map_err(|_| FerruleError::QueueClosed)?;
        produced += 1;
        debug!(batch = produced, rows, "Produced record batch");
    }

    debug!(batches = produced, "Record batch producer finished");
    Ok(produced)
}

/// Run [`produce`] as a background task.
///
/// The sender is dropped when the task ends. Cancelling the consumer does not
/// stop the producer: abort or join the returned handle.
pub fn spawn_producer<D>(mut decoder: D, queue: BatchSender) -> JoinHandle<Result<u64>>
where
    D: ColumnarDecoder + 'static,
{
    tokio::spawn(async move { produce(&mut decoder, &queue).await })
}
