//! Consumers pop pages from the batch queue and upsert them into the destination.

use crate::db::DestinationPool;
use crate::db::executor;
use crate::error::{EtlError, EtlResult};
use crate::models::TableSchema;
use crate::pipeline::queue::BatchReceiver;
use crate::pipeline::retry::RetryPolicy;
use crate::progress::{TableTracker, WorkerTracker};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One consumer of a table.
pub struct Consumer {
    pub schema: Arc<TableSchema>,
    pub destination: DestinationPool,
    /// Rows per upsert transaction.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub queue: BatchReceiver,
    pub table: TableTracker,
    pub tracker: WorkerTracker,
    pub cancel: CancellationToken,
}

impl Consumer {
    /// Apply batches until the queue is closed and empty. Returns the rows applied.
    ///
    /// On failure the queue is closed and drained so producers stop.
    pub async fn run(self) -> EtlResult<u64> {
        self.tracker.set_status("waiting");
        match self.apply_all().await {
            Ok(rows) => {
                self.tracker.set_status("done");
                Ok(rows)
            }
            Err(err) if matches!(err, EtlError::Cancelled { .. }) => {
                self.tracker.set_status("cancelled");
                Err(err)
            }
            Err(err) => {
                let discarded = self.queue.close_and_drain();
                self.tracker.fail(&err.to_string());
                warn!(
                    table = %self.schema.table_name,
                    worker = %self.tracker.id(),
                    discarded_batches = discarded,
                    error = %err,
                    "Consumer failed"
                );
                Err(err)
            }
        }
    }

    async fn apply_all(&self) -> EtlResult<u64> {
        let pool = self.destination.pool();
        let schema = self.schema.as_ref();
        let operation = format!("writing {}", schema.table_name);
        let mut applied = 0u64;

        while let Some(batch) = self.queue.pop(&self.cancel).await? {
            self.tracker.set_status("writing");
            for rows in batch.chunks(self.batch_size.max(1)) {
                let written = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return Err(EtlError::cancelled(operation.clone()));
                    }
                    written = self.retry.run(
                        &operation,
                        &self.cancel,
                        |attempt, err| {
                            warn!(
                                table = %schema.table_name,
                                worker = %self.tracker.id(),
                                attempt,
                                error = %err,
                                "Batch write failed, retrying"
                            );
                            self.tracker.set_status(format!("retrying write ({})", attempt));
                        },
                        move || executor::upsert_rows(pool, schema, rows),
                    ) => written?,
                };
                applied += written;
                self.table.add_dst_rows(written);
                self.tracker.add_rows(written);
            }
            self.tracker.set_status("waiting");
        }

        debug!(
            table = %schema.table_name,
            worker = %self.tracker.id(),
            rows = applied,
            "Consumer finished"
        );
        Ok(applied)
    }
}
