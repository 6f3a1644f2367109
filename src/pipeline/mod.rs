//! Per-table producer → queue → consumer pipeline.
//!
//! [`run_table`] wires one table's workers together: producers page the
//! source in key order, consumers upsert into the destination, and a bounded
//! queue between them provides backpressure. Each worker owns one
//! [`WorkerSlot`] of the global budget and returns it when it exits.

pub mod consumer;
pub mod producer;
pub mod queue;
pub mod retry;

pub use consumer::Consumer;
pub use producer::{KeyRange, Producer, split_key_range};
pub use queue::{Batch, BatchReceiver, BatchSender, batch_queue};
pub use retry::RetryPolicy;

use crate::db::{RunPools, SchemaInspector};
use crate::error::{EtlError, EtlResult};
use crate::models::{TableSchema, WorkerKind};
use crate::planner::{TablePlan, WorkerSlot};
use crate::progress::TableTracker;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Rows moved by one table pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub rows_read: u64,
    pub rows_written: u64,
}

/// Key ranges for the table's producers.
///
/// Only a single integer key is split; every other table gets one producer
/// reading the whole key space.
pub async fn plan_ranges(
    pools: &RunPools,
    schema: &TableSchema,
    producers: usize,
) -> EtlResult<Vec<Option<KeyRange>>> {
    if producers <= 1 || !schema.integer_key {
        return Ok(vec![None]);
    }
    let bounds = SchemaInspector::key_bounds(
        pools.source.pool(),
        &schema.table_name,
        &schema.key.columns[0],
    )
    .await?;
    Ok(match bounds {
        Some((min, max)) => split_key_range(min, max, producers)
            .into_iter()
            .map(Some)
            .collect(),
        None => vec![None],
    })
}

enum WorkerOutcome {
    Produced(EtlResult<u64>),
    Consumed(EtlResult<u64>),
}

/// Copy every row of a table with the given plan.
///
/// `slots` must hold at least one slot per planned worker. A worker failure
/// cancels its siblings; the first failure that is not a cancellation is
/// returned. When `cancel` fires, the result is `Cancelled`.
pub async fn run_table(
    pools: &RunPools,
    schema: Arc<TableSchema>,
    plan: TablePlan,
    mut slots: Vec<WorkerSlot>,
    retry: RetryPolicy,
    table: &TableTracker,
    cancel: &CancellationToken,
) -> EtlResult<PipelineStats> {
    let workers = plan.fit(slots.len());
    let ranges = plan_ranges(pools, &schema, workers.num_producers).await?;
    let (sender, receiver) = batch_queue(workers.queue_capacity());
    let attempt = cancel.child_token();
    let mut tasks = JoinSet::new();

    debug!(
        table = %schema.table_name,
        producers = ranges.len(),
        consumers = workers.num_consumers,
        chunk_size = workers.chunk_size,
        batch_size = workers.batch_size,
        "Starting table pipeline"
    );

    for (index, range) in ranges.into_iter().enumerate() {
        let Some(slot) = slots.pop() else {
            break;
        };
        let producer = Producer {
            schema: Arc::clone(&schema),
            source: pools.source.clone(),
            range,
            chunk_size: workers.chunk_size,
            retry,
            queue: sender.clone(),
            tracker: table.worker(
                WorkerKind::Producer,
                index + 1,
                range.map(|r| r.width()).unwrap_or(0),
            ),
            cancel: attempt.clone(),
        };
        let on_failure = FailureHook::new(&attempt, &receiver);
        tasks.spawn(async move {
            let _slot: WorkerSlot = slot;
            let result = producer.run().await;
            on_failure.observe(&result);
            WorkerOutcome::Produced(result)
        });
    }
    drop(sender);

    for index in 0..workers.num_consumers {
        let Some(slot) = slots.pop() else {
            break;
        };
        let consumer = Consumer {
            schema: Arc::clone(&schema),
            destination: pools.destination.clone(),
            batch_size: workers.batch_size,
            retry,
            queue: receiver.clone(),
            table: table.clone(),
            tracker: table.worker(WorkerKind::Consumer, index + 1, 0),
            cancel: attempt.clone(),
        };
        let on_failure = FailureHook::new(&attempt, &receiver);
        tasks.spawn(async move {
            let _slot: WorkerSlot = slot;
            let result = consumer.run().await;
            on_failure.observe(&result);
            WorkerOutcome::Consumed(result)
        });
    }
    drop(receiver);
    // Unused slots go back to the budget right away.
    drop(slots);

    let mut stats = PipelineStats::default();
    let mut failure: Option<EtlError> = None;
    while let Some(joined) = tasks.join_next().await {
        let (result, produced) = match joined {
            Ok(WorkerOutcome::Produced(result)) => (result, true),
            Ok(WorkerOutcome::Consumed(result)) => (result, false),
            Err(join_err) => {
                attempt.cancel();
                (
                    Err(EtlError::internal(format!("worker task failed: {}", join_err))),
                    false,
                )
            }
        };
        match result {
            Ok(rows) if produced => stats.rows_read += rows,
            Ok(rows) => stats.rows_written += rows,
            Err(EtlError::Cancelled { .. }) => {}
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    attempt.cancel();

    if let Some(err) = failure {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(EtlError::cancelled(format!("loading {}", schema.table_name)));
    }

    info!(
        table = %schema.table_name,
        rows_read = stats.rows_read,
        rows_written = stats.rows_written,
        "Table pipeline finished"
    );
    Ok(stats)
}

/// Stops the rest of a table's workers once one of them fails.
struct FailureHook {
    attempt: CancellationToken,
    queue: BatchReceiver,
}

impl FailureHook {
    fn new(attempt: &CancellationToken, queue: &BatchReceiver) -> Self {
        Self {
            attempt: attempt.clone(),
            queue: queue.clone(),
        }
    }

    fn observe(&self, result: &EtlResult<u64>) {
        if let Err(err) = result {
            if !matches!(err, EtlError::Cancelled { .. }) {
                self.queue.close_and_drain();
                self.attempt.cancel();
            }
        }
    }
}
