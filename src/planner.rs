//! Batch planning and the global worker budget.
//!
//! The planner maps a table's row count onto a configurable band of worker
//! counts and page sizes. The budget hands out one slot per producer or
//! consumer; a table starts only once a producer slot and a consumer slot are
//! free, so concurrently active workers never exceed `max_workers`.

use crate::config::RunConfig;
use crate::error::{EtlError, EtlResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One row-count band of the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerBand {
    /// Exclusive upper bound on the row count. `None` covers everything above.
    pub below_rows: Option<u64>,
    pub producers: usize,
    pub consumers: usize,
    /// Page size for the band. `None` pins it at `max_batch_size`.
    pub batch: Option<usize>,
}

impl PlannerBand {
    const fn new(
        below_rows: Option<u64>,
        producers: usize,
        consumers: usize,
        batch: Option<usize>,
    ) -> Self {
        Self {
            below_rows,
            producers,
            consumers,
            batch,
        }
    }

    fn covers(&self, rows: u64) -> bool {
        self.below_rows.is_none_or(|limit| rows < limit)
    }
}

/// Default bands, from tiny tables to tables above a million rows.
pub fn default_bands() -> Vec<PlannerBand> {
    vec![
        PlannerBand::new(Some(1_000), 2, 2, Some(1_000)),
        PlannerBand::new(Some(10_000), 3, 3, Some(2_000)),
        PlannerBand::new(Some(100_000), 5, 5, Some(5_000)),
        PlannerBand::new(Some(1_000_000), 8, 8, Some(5_000)),
        PlannerBand::new(None, 10, 10, None),
    ]
}

/// Parse bands from `rows:producers:consumers:batch` entries separated by commas.
///
/// `*` as the row bound means unbounded and `max` as the batch pins the page
/// size at the configured ceiling, e.g. `1000:2:2:1000,*:10:10:max`.
pub fn parse_bands(raw: &str) -> Result<Vec<PlannerBand>, String> {
    let bands = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_band)
        .collect::<Result<Vec<_>, _>>()?;
    validate_bands(&bands)?;
    Ok(bands)
}

fn parse_band(entry: &str) -> Result<PlannerBand, String> {
    let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
    let [rows, producers, consumers, batch] = parts.as_slice() else {
        return Err(format!(
            "Invalid planner band '{}': expected rows:producers:consumers:batch",
            entry
        ));
    };

    let number = |value: &str, what: &str| -> Result<u64, String> {
        value
            .parse::<u64>()
            .map_err(|_| format!("Invalid {} '{}' in planner band '{}'", what, value, entry))
    };

    let below_rows = match *rows {
        "*" => None,
        v => Some(number(v, "row bound")?),
    };
    let batch = match batch.to_ascii_lowercase().as_str() {
        "max" => None,
        v => Some(number(v, "batch size")? as usize),
    };

    Ok(PlannerBand::new(
        below_rows,
        number(producers, "producer count")? as usize,
        number(consumers, "consumer count")? as usize,
        batch,
    ))
}

/// Render bands back into the `PLANNER_BANDS` format.
pub fn format_bands(bands: &[PlannerBand]) -> String {
    bands
        .iter()
        .map(|b| {
            format!(
                "{}:{}:{}:{}",
                b.below_rows.map_or_else(|| "*".to_string(), |r| r.to_string()),
                b.producers,
                b.consumers,
                b.batch.map_or_else(|| "max".to_string(), |s| s.to_string()),
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Check that bands are ascending, end with an unbounded band, and assign workers.
pub fn validate_bands(bands: &[PlannerBand]) -> Result<(), String> {
    let Some(last) = bands.last() else {
        return Err("At least one planner band is required".to_string());
    };
    if last.below_rows.is_some() {
        return Err("The last planner band must be unbounded ('*')".to_string());
    }

    let mut previous: Option<u64> = None;
    for (idx, band) in bands.iter().enumerate() {
        if band.producers == 0 || band.consumers == 0 {
            return Err(format!(
                "Planner band {} must assign at least one producer and one consumer",
                idx + 1
            ));
        }
        if band.batch == Some(0) {
            return Err(format!("Planner band {} has a zero batch size", idx + 1));
        }
        match (band.below_rows, previous) {
            (None, _) if idx + 1 != bands.len() => {
                return Err("Only the last planner band may be unbounded".to_string());
            }
            (Some(limit), Some(prev)) if limit <= prev => {
                return Err(format!(
                    "Planner band bounds must be ascending ({} after {})",
                    limit, prev
                ));
            }
            _ => {}
        }
        previous = band.below_rows.or(previous);
    }
    Ok(())
}

/// Page and worker assignment for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TablePlan {
    pub num_producers: usize,
    pub num_consumers: usize,
    /// Rows fetched per page by a producer.
    pub chunk_size: usize,
    /// Rows applied per upsert transaction by a consumer.
    pub batch_size: usize,
}

impl TablePlan {
    /// Total workers the plan asks for.
    pub fn workers(&self) -> usize {
        self.num_producers + self.num_consumers
    }

    /// Capacity of the table's batch queue.
    pub fn queue_capacity(&self) -> usize {
        self.num_consumers * 2
    }

    /// Shrink the plan to `granted` workers, keeping at least one of each kind.
    pub fn fit(&self, granted: usize) -> TablePlan {
        let granted = granted.max(2);
        if self.workers() <= granted {
            return *self;
        }
        let producers = (granted * self.num_producers / self.workers())
            .clamp(1, granted - 1)
            .min(self.num_producers);
        let consumers = (granted - producers).min(self.num_consumers);
        TablePlan {
            num_producers: producers,
            num_consumers: consumers,
            ..*self
        }
    }
}

/// Derives a [`TablePlan`] from a row count.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    bands: Vec<PlannerBand>,
    batch_size: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    max_workers: usize,
}

impl BatchPlanner {
    pub fn new(
        bands: Vec<PlannerBand>,
        batch_size: usize,
        min_batch_size: usize,
        max_batch_size: usize,
        max_workers: usize,
    ) -> Self {
        let bands = if bands.is_empty() {
            default_bands()
        } else {
            bands
        };
        let min_batch_size = min_batch_size.max(1);
        Self {
            bands,
            batch_size,
            min_batch_size,
            max_batch_size: max_batch_size.max(min_batch_size),
            max_workers: max_workers.max(2),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.planner_bands.clone(),
            config.batch_size,
            config.min_batch_size,
            config.max_batch_size,
            config.max_workers,
        )
    }

    /// Plan a table.
    ///
    /// `splittable` is false when the key cannot be divided into ranges, in
    /// which case a single producer pages the whole table.
    pub fn plan(&self, row_count: u64, splittable: bool) -> TablePlan {
        let band = self
            .bands
            .iter()
            .find(|b| b.covers(row_count))
            .or(self.bands.last())
            .copied()
            .unwrap_or(PlannerBand::new(None, 1, 1, None));

        let chunk_size = band
            .batch
            .unwrap_or(self.max_batch_size)
            .clamp(self.min_batch_size, self.max_batch_size);
        let batch_size = self
            .batch_size
            .min(chunk_size)
            .clamp(self.min_batch_size, self.max_batch_size);

        let pages = row_count.div_ceil(chunk_size as u64).max(1);
        let pages = usize::try_from(pages).unwrap_or(usize::MAX);

        let producers = if splittable {
            band.producers.min(pages).max(1)
        } else {
            1
        };
        let consumers = band.consumers.min(pages).max(1);

        TablePlan {
            num_producers: producers,
            num_consumers: consumers,
            chunk_size,
            batch_size,
        }
        .fit(self.max_workers)
    }
}

/// Global worker budget shared by every table of a run.
#[derive(Debug, Clone)]
pub struct WorkerBudget {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    peak: Arc<AtomicUsize>,
}

impl WorkerBudget {
    pub fn new(max_workers: usize) -> Self {
        let capacity = max_workers.max(2);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held by workers.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Highest number of simultaneously held slots observed so far.
    pub fn peak_in_use(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Reserve slots for a table.
    ///
    /// Waits until one producer slot and one consumer slot are free, then
    /// takes up to `wanted` slots in total without waiting further.
    pub async fn acquire(
        &self,
        wanted: usize,
        cancel: &CancellationToken,
    ) -> EtlResult<Vec<WorkerSlot>> {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_many_owned(2) => permit
                .map_err(|_| EtlError::internal("worker budget closed"))?,
            _ = cancel.cancelled() => return Err(EtlError::cancelled("waiting for worker slots")),
        };
        permit.forget();

        let mut slots = vec![self.slot(), self.slot()];
        while slots.len() < wanted {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    permit.forget();
                    slots.push(self.slot());
                }
                Err(_) => break,
            }
        }
        self.peak.fetch_max(self.in_use(), Ordering::AcqRel);
        Ok(slots)
    }

    fn slot(&self) -> WorkerSlot {
        WorkerSlot {
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

/// One reserved worker. Returns its slot to the budget when dropped.
#[derive(Debug)]
pub struct WorkerSlot {
    semaphore: Arc<Semaphore>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.semaphore.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn planner(min: usize, max: usize, workers: usize) -> BatchPlanner {
        BatchPlanner::new(default_bands(), 5_000, min, max, workers)
    }

    #[test]
    fn test_default_bands_validate() {
        assert!(validate_bands(&default_bands()).is_ok());
    }

    #[test]
    fn test_parse_bands_roundtrip_format() {
        let raw = "1000:2:2:1000,10000:3:3:2000,*:10:10:max";
        let bands = parse_bands(raw).unwrap();
        assert_eq!(bands.len(), 3);
        assert_eq!(bands[2].below_rows, None);
        assert_eq!(bands[2].batch, None);
        assert_eq!(format_bands(&bands), raw);
    }

    #[test]
    fn test_parse_bands_rejects_bad_input() {
        assert!(parse_bands("1000:2:2").is_err());
        assert!(parse_bands("1000:2:2:1000").is_err()); // no unbounded band
        assert!(parse_bands("*:2:2:1000,1000:2:2:100").is_err());
        assert!(parse_bands("1000:0:2:1000,*:1:1:max").is_err());
        assert!(parse_bands("1000:2:2:100,500:2:2:100,*:1:1:max").is_err());
        assert!(parse_bands("abc:2:2:100,*:1:1:max").is_err());
    }

    #[test]
    fn test_plan_small_table() {
        let plan = planner(500, 50_000, 20).plan(5, true);
        assert_eq!(plan.chunk_size, 1_000);
        assert_eq!(plan.batch_size, 1_000);
        // five rows fit in a single page
        assert_eq!(plan.num_producers, 1);
        assert_eq!(plan.num_consumers, 1);
    }

    #[test]
    fn test_plan_large_table_pins_batch_at_ceiling() {
        let plan = planner(500, 20_000, 40).plan(5_000_000, true);
        assert_eq!(plan.chunk_size, 20_000);
        assert_eq!(plan.batch_size, 5_000);
        assert_eq!(plan.num_producers, 10);
        assert_eq!(plan.num_consumers, 10);
    }

    #[test]
    fn test_plan_unsplittable_key_uses_one_producer() {
        let plan = planner(500, 50_000, 20).plan(500_000, false);
        assert_eq!(plan.num_producers, 1);
        assert_eq!(plan.num_consumers, 8);
    }

    #[test]
    fn test_plan_respects_max_workers() {
        let plan = planner(500, 50_000, 6).plan(5_000_000, true);
        assert!(plan.workers() <= 6);
        assert!(plan.num_producers >= 1);
        assert!(plan.num_consumers >= 1);
    }

    #[test]
    fn test_chunk_size_within_bounds_for_any_row_count() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let min = rng.gen_range(1..10_000);
            let max = rng.gen_range(min..100_000);
            let rows = rng.gen_range(0..50_000_000u64);
            let plan = planner(min, max, rng.gen_range(2..64)).plan(rows, rng.r#gen());
            assert!(
                (min..=max).contains(&plan.chunk_size),
                "chunk {} outside [{}, {}]",
                plan.chunk_size,
                min,
                max
            );
            assert!(plan.batch_size >= min && plan.batch_size <= plan.chunk_size);
        }
    }

    #[test]
    fn test_fit_keeps_one_of_each() {
        let plan = TablePlan {
            num_producers: 5,
            num_consumers: 5,
            chunk_size: 1000,
            batch_size: 1000,
        };
        let fitted = plan.fit(2);
        assert_eq!((fitted.num_producers, fitted.num_consumers), (1, 1));
        let fitted = plan.fit(3);
        assert_eq!(fitted.workers(), 3);
        assert_eq!(plan.fit(20), plan);
    }

    #[tokio::test]
    async fn test_budget_degrades_and_serializes() {
        let budget = WorkerBudget::new(3);
        let cancel = CancellationToken::new();

        let first = budget.acquire(10, &cancel).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(budget.in_use(), 3);

        // The second table must wait until two slots come back.
        let waiting = {
            let budget = budget.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { budget.acquire(4, &cancel).await.map(|s| s.len()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(first);
        let granted = waiting.await.unwrap().unwrap();
        assert!((2..=3).contains(&granted));
        assert!(budget.peak_in_use() <= budget.capacity());
    }

    #[tokio::test]
    async fn test_budget_acquire_observes_cancellation() {
        let budget = WorkerBudget::new(2);
        let cancel = CancellationToken::new();
        let _held = budget.acquire(2, &cancel).await.unwrap();

        cancel.cancel();
        let result = budget.acquire(2, &cancel).await;
        assert!(matches!(result, Err(EtlError::Cancelled { .. })));
    }
}
