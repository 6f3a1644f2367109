//! Bounded batch queue between a table's producers and consumers.
//!
//! Backed by an `async_channel` MPMC channel: producers block on a full
//! queue, consumers on an empty one, and the queue closes once every sender
//! is dropped.

use crate::db::SqlRow;
use crate::error::{EtlError, EtlResult};
use tokio_util::sync::CancellationToken;

/// One source page, in key order.
pub type Batch = Vec<SqlRow>;

/// Create a queue holding at most `capacity` batches.
pub fn batch_queue(capacity: usize) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    (BatchSender(tx), BatchReceiver(rx))
}

#[derive(Debug, Clone)]
pub struct BatchSender(async_channel::Sender<Batch>);

impl BatchSender {
    /// Push a batch, waiting while the queue is full.
    ///
    /// Fails with `Cancelled` when the token fires or the consumers closed
    /// the queue.
    pub async fn push(&self, batch: Batch, cancel: &CancellationToken) -> EtlResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EtlError::cancelled("pushing batch")),
            sent = self.0.send(batch) => {
                sent.map_err(|_| EtlError::cancelled("batch queue closed"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReceiver(async_channel::Receiver<Batch>);

impl BatchReceiver {
    /// Next batch, or `None` once the queue is closed and empty.
    pub async fn pop(&self, cancel: &CancellationToken) -> EtlResult<Option<Batch>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EtlError::cancelled("waiting for batch")),
            received = self.0.recv() => Ok(received.ok()),
        }
    }

    /// Close the queue and discard whatever is still buffered.
    ///
    /// Returns the number of discarded batches.
    pub fn close_and_drain(&self) -> usize {
        self.0.close();
        let mut discarded = 0;
        while self.0.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
