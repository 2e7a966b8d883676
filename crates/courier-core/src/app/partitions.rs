//! PartitionManager - 時間範囲パーティションの作成と削除
//!
//! Ranges are whole UTC days, `days_per_partition` wide, aligned to the Unix
//! epoch. Every run therefore computes the same bounds no matter when it starts,
//! and consecutive ranges never overlap (`[from, to)` with `to` = next `from`).
//!
//! ```text
//!            retire window (precreate_partition_count ranges)     create window
//!  ... | drop | drop | drop | drop | keep | keep | keep || now | +1 | +2 | ... |
//!                                  \_ retention count _/
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, error, info, warn};

use super::options::{MAX_DAYS_PER_PARTITION, MAX_PARTITION_COUNT, PartitionSettings};
use crate::domain::{ItemId, OutboxError, OutboxResult};
use crate::ports::{Clock, PartitionError, PartitionRange, PartitionStore};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

impl PartitionSettings {
    fn span_days(&self) -> i64 {
        i64::from(self.days_per_partition.max(1))
    }

    /// Start of the range containing `at`.
    fn range_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let span = self.span_days();
        let day = at.timestamp().div_euclid(SECONDS_PER_DAY);
        epoch_day(day - day.rem_euclid(span))
    }

    /// `precreate_partition_count` consecutive ranges, the first one containing `anchor`.
    ///
    /// Settings beyond the validated bounds, or ranges past chrono's date
    /// range, are an `InvalidConfiguration` error.
    pub fn ranges(
        &self,
        table: &str,
        anchor: DateTime<Utc>,
    ) -> OutboxResult<Vec<PartitionRange>> {
        if self.days_per_partition > MAX_DAYS_PER_PARTITION
            || self.precreate_partition_count > MAX_PARTITION_COUNT
        {
            return Err(out_of_bounds(table));
        }
        let span = Duration::try_days(self.span_days()).ok_or_else(|| out_of_bounds(table))?;
        let mut from = self.range_start(anchor).ok_or_else(|| out_of_bounds(table))?;
        let mut ranges = Vec::with_capacity(self.precreate_partition_count as usize);
        for _ in 0..self.precreate_partition_count {
            let to = from
                .checked_add_signed(span)
                .ok_or_else(|| out_of_bounds(table))?;
            ranges.push(PartitionRange {
                name: partition_name(table, from),
                from: ItemId::range_start(from),
                to: ItemId::range_start(to),
            });
            from = to;
        }
        Ok(ranges)
    }

    /// The ranges that precede the current one, newest first, minus the
    /// `partition_retention_count` newest.
    pub fn expired_ranges(
        &self,
        table: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<PartitionRange>> {
        let anchor = self
            .span_days()
            .checked_mul(i64::from(self.precreate_partition_count))
            .and_then(Duration::try_days)
            .zip(self.range_start(now))
            .and_then(|(back, start)| start.checked_sub_signed(back))
            .ok_or_else(|| out_of_bounds(table))?;
        let mut ranges = self.ranges(table, anchor)?;
        ranges.reverse();
        Ok(ranges
            .into_iter()
            .skip(self.partition_retention_count as usize)
            .collect())
    }
}

fn out_of_bounds(table: &str) -> OutboxError {
    OutboxError::InvalidConfiguration {
        outbox: table.to_string(),
        reason: "partition ranges fall outside the supported bounds".to_string(),
    }
}

/// `<table>_pYYYYMMDD`
pub fn partition_name(table: &str, from: DateTime<Utc>) -> String {
    format!("{table}_p{}", from.format("%Y%m%d"))
}

fn epoch_day(day: i64) -> Option<DateTime<Utc>> {
    let seconds = day.checked_mul(SECONDS_PER_DAY)?;
    Utc.timestamp_opt(seconds, 0).single()
}

/// Creates upcoming partitions and retires old ones for one outbox table.
///
/// Both operations are idempotent and safe to run concurrently from several
/// processes.
pub struct PartitionManager {
    outbox: String,
    store: Arc<dyn PartitionStore>,
    clock: Arc<dyn Clock>,
}

impl PartitionManager {
    pub fn new(
        outbox: impl Into<String>,
        store: Arc<dyn PartitionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            outbox: outbox.into(),
            store,
            clock,
        }
    }

    pub fn outbox(&self) -> &str {
        &self.outbox
    }

    /// Ensures the partitions for the current and upcoming ranges exist.
    ///
    /// Returns the number of ranges ensured.
    pub async fn create_upcoming_partitions(
        &self,
        settings: &PartitionSettings,
    ) -> OutboxResult<usize> {
        let ranges = settings.ranges(self.store.table(), self.clock.now())?;
        for range in &ranges {
            match self.store.create_if_not_exists(range).await {
                Ok(()) => {
                    debug!(outbox = %self.outbox, partition = %range.name, "partition ensured")
                }
                Err(err) => return Err(self.classify(&range.name, err)),
            }
        }
        info!(outbox = %self.outbox, count = ranges.len(), "upcoming partitions ensured");
        Ok(ranges.len())
    }

    /// Detaches and drops partitions older than the retention window.
    ///
    /// Partitions already removed by a concurrent run are skipped. Returns the
    /// number of partitions this call dropped.
    pub async fn retire_old_partitions(
        &self,
        settings: &PartitionSettings,
    ) -> OutboxResult<usize> {
        let mut dropped = 0;
        for range in settings.expired_ranges(self.store.table(), self.clock.now())? {
            match self.store.detach_concurrently(&range.name).await {
                Ok(()) => {}
                // already detached (or gone); a detached leftover still gets dropped
                Err(PartitionError::NotFound(_)) => {
                    debug!(
                        outbox = %self.outbox,
                        partition = %range.name,
                        "partition not attached"
                    );
                }
                Err(err) => return Err(self.classify(&range.name, err)),
            }
            match self.store.drop_partition(&range.name).await {
                Ok(()) => {
                    info!(outbox = %self.outbox, partition = %range.name, "partition dropped");
                    dropped += 1;
                }
                Err(PartitionError::NotFound(_)) => {
                    debug!(
                        outbox = %self.outbox,
                        partition = %range.name,
                        "partition already dropped"
                    );
                }
                Err(err) => return Err(self.classify(&range.name, err)),
            }
        }
        Ok(dropped)
    }

    fn classify(&self, partition: &str, err: PartitionError) -> OutboxError {
        match err {
            PartitionError::NotPartitioned(detail) => {
                error!(
                    outbox = %self.outbox,
                    table = %self.store.table(),
                    %detail,
                    "partitioning is enabled but the table is not partitioned"
                );
                OutboxError::PartitioningNotConfigured(self.store.table().to_string())
            }
            other => {
                warn!(
                    outbox = %self.outbox,
                    partition,
                    error = %other,
                    "partition maintenance failed"
                );
                OutboxError::Partition {
                    partition: partition.to_string(),
                    reason: other.to_string(),
                }
            }
        }
    }
}
