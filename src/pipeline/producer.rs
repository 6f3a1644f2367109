//! Producers read a table in key order and push pages onto the batch queue.

use crate::db::executor::{self, PageBinds};
use crate::db::sql::{self, PageShape};
use crate::db::{SourcePool, SqlValue};
use crate::error::{EtlError, EtlResult};
use crate::models::TableSchema;
use crate::pipeline::queue::BatchSender;
use crate::pipeline::retry::RetryPolicy;
use crate::progress::WorkerTracker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Inclusive range of a single integer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub start: i64,
    pub end: i64,
}

impl KeyRange {
    /// Number of key values covered.
    pub fn width(&self) -> u64 {
        (self.end as i128 - self.start as i128 + 1).max(0) as u64
    }
}

/// Split `[min, max]` into at most `parts` contiguous ranges of near-equal width.
pub fn split_key_range(min: i64, max: i64, parts: usize) -> Vec<KeyRange> {
    if parts <= 1 || min >= max {
        return vec![KeyRange {
            start: min,
            end: max.max(min),
        }];
    }

    let (min, max) = (min as i128, max as i128);
    let span = max - min + 1;
    let parts = (parts as i128).min(span);
    let step = (span + parts - 1) / parts;

    let mut ranges = Vec::with_capacity(parts as usize);
    let mut start = min;
    while start <= max {
        let end = (start + step - 1).min(max);
        ranges.push(KeyRange {
            start: start as i64,
            end: end as i64,
        });
        start = end + 1;
    }
    ranges
}

/// One producer of a table.
pub struct Producer {
    pub schema: Arc<TableSchema>,
    pub source: SourcePool,
    /// Key range to read; `None` reads the whole table.
    pub range: Option<KeyRange>,
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub queue: BatchSender,
    pub tracker: WorkerTracker,
    pub cancel: CancellationToken,
}

impl Producer {
    /// Page through the assigned range. Returns the number of rows read.
    pub async fn run(self) -> EtlResult<u64> {
        self.tracker.set_status("reading");
        match self.read_all().await {
            Ok(rows) => {
                self.tracker.set_status("done");
                Ok(rows)
            }
            Err(err) => {
                if !matches!(err, EtlError::Cancelled { .. }) {
                    self.tracker.fail(&err.to_string());
                } else {
                    self.tracker.set_status("cancelled");
                }
                Err(err)
            }
        }
    }

    async fn read_all(&self) -> EtlResult<u64> {
        let pool = self.source.pool();
        let db = pool.db_type();
        let table = self.schema.table_name.as_str();
        let columns = self.schema.column_names();
        let key = &self.schema.key.columns;
        let key_positions = self.schema.key_positions();
        let upper_bound = self.range.map(|r| r.end);
        let limit = self.chunk_size.max(1);

        let shape = |after_cursor| PageShape {
            after_cursor,
            upper_bound: upper_bound.is_some(),
            limit,
        };
        let first_page = sql::select_page(db, table, &columns, key, shape(false));
        let next_page = sql::select_page(db, table, &columns, key, shape(true));

        // Ranges start just below their first key so every page uses the cursor form.
        let mut cursor: Option<Vec<SqlValue>> = self
            .range
            .and_then(|r| r.start.checked_sub(1))
            .map(|below| vec![SqlValue::I64(below)]);
        let mut rows_read = 0u64;
        let operation = format!("reading {}", table);

        loop {
            if self.cancel.is_cancelled() {
                return Err(EtlError::cancelled(operation));
            }

            let query_sql = if cursor.is_some() {
                next_page.as_str()
            } else {
                first_page.as_str()
            };
            let binds = PageBinds {
                cursor: cursor.as_deref(),
                upper_bound,
            };

            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EtlError::cancelled(operation.clone())),
                page = self.retry.run(
                    &operation,
                    &self.cancel,
                    |attempt, err| {
                        warn!(
                            table = %table,
                            worker = %self.tracker.id(),
                            attempt,
                            error = %err,
                            "Page read failed, retrying"
                        );
                        self.tracker.set_status(format!("retrying read ({})", attempt));
                    },
                    move || executor::fetch_page(pool, query_sql, binds),
                ) => page?,
            };

            let page_len = page.len();
            if page_len == 0 {
                break;
            }

            let last = page
                .last()
                .map(|row| key_positions.iter().map(|&i| row[i].clone()).collect::<Vec<_>>())
                .ok_or_else(|| EtlError::internal("page unexpectedly empty"))?;
            if last.iter().any(SqlValue::is_null) {
                return Err(EtlError::schema("Key column returned NULL", table));
            }

            self.queue.push(page, &self.cancel).await?;
            rows_read += page_len as u64;
            self.tracker.add_rows(page_len as u64);
            self.tracker.set_status("reading");
            cursor = Some(last);

            if page_len < limit {
                break;
            }
        }

        debug!(table = %table, worker = %self.tracker.id(), rows = rows_read, "Producer finished");
        Ok(rows_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_covers_range_without_gaps() {
        let ranges = split_key_range(1, 100, 3);
        assert_eq!(
            ranges,
            vec![
                KeyRange { start: 1, end: 34 },
                KeyRange { start: 35, end: 68 },
                KeyRange { start: 69, end: 100 },
            ]
        );
        assert_eq!(ranges.iter().map(KeyRange::width).sum::<u64>(), 100);
    }

    #[test]
    fn test_split_small_span_yields_fewer_ranges() {
        let ranges = split_key_range(10, 12, 8);
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(|r| r.width() == 1));
    }

    #[test]
    fn test_split_single_part_or_single_value() {
        assert_eq!(split_key_range(5, 5, 4), vec![KeyRange { start: 5, end: 5 }]);
        assert_eq!(split_key_range(1, 50, 1), vec![KeyRange { start: 1, end: 50 }]);
    }

    #[test]
    fn test_split_extreme_bounds_do_not_overflow() {
        let ranges = split_key_range(i64::MIN, i64::MAX, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].start, i64::MIN);
        assert_eq!(ranges[3].end, i64::MAX);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
    }
}
